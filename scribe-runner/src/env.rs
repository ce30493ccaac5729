//! Child environment composition.
//!
//! Subprocesses (the supervised child and post-render commands) receive the
//! coordination-service connection settings as environment variables so they
//! can talk to the same endpoints the agent does. The injected variables come
//! first; user-configured env and programmatic runner env override them.

use std::collections::HashMap;

use scribe_core::config::Config;

/// Compose the base subprocess environment from the configured connection
/// settings, the config-level `env`, and the runner's programmatic env, in
/// ascending precedence.
pub fn child_env(config: &Config, runner_env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env = HashMap::new();

    if let Some(address) = &config.registry.address {
        env.insert("SCRIBE_REGISTRY_ADDR".to_string(), address.clone());
    }
    if let Some(auth) = &config.registry.auth {
        env.insert(
            "SCRIBE_REGISTRY_AUTH".to_string(),
            format!("{}:{}", auth.username, auth.password),
        );
    }
    env.insert(
        "SCRIBE_REGISTRY_SSL".to_string(),
        config.registry.tls.enabled.to_string(),
    );
    env.insert(
        "SCRIBE_REGISTRY_SSL_VERIFY".to_string(),
        config.registry.tls.verify.to_string(),
    );

    if let Some(address) = &config.secrets.address {
        env.insert("SCRIBE_SECRETS_ADDR".to_string(), address.clone());
    }
    if !config.secrets.tls.verify {
        env.insert("SCRIBE_SECRETS_SKIP_VERIFY".to_string(), "true".to_string());
    }
    if let Some(cert) = &config.secrets.tls.cert {
        env.insert(
            "SCRIBE_SECRETS_CLIENT_CERT".to_string(),
            cert.display().to_string(),
        );
    }
    if let Some(key) = &config.secrets.tls.key {
        env.insert(
            "SCRIBE_SECRETS_CLIENT_KEY".to_string(),
            key.display().to_string(),
        );
    }
    if let Some(ca_cert) = &config.secrets.tls.ca_cert {
        env.insert(
            "SCRIBE_SECRETS_CA_CERT".to_string(),
            ca_cert.display().to_string(),
        );
    }
    if let Some(server_name) = &config.secrets.tls.server_name {
        env.insert(
            "SCRIBE_SECRETS_SERVER_NAME".to_string(),
            server_name.clone(),
        );
    }

    for (key, value) in &config.env {
        env.insert(key.clone(), value.clone());
    }
    for (key, value) in runner_env {
        env.insert(key.clone(), value.clone());
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::config::{AuthConfig, RegistryConfig, SecretsConfig, TlsConfig};

    fn base_config() -> Config {
        Config {
            registry: RegistryConfig {
                address: Some("http://127.0.0.1:8500".into()),
                auth: Some(AuthConfig {
                    username: "scribe".into(),
                    password: "s3cret".into(),
                }),
                tls: TlsConfig::default(),
            },
            secrets: SecretsConfig {
                address: Some("https://127.0.0.1:8200".into()),
                tls: TlsConfig {
                    verify: false,
                    ..TlsConfig::default()
                },
            },
            ..Config::default()
        }
    }

    #[test]
    fn connection_settings_are_injected() {
        let env = child_env(&base_config(), &HashMap::new());
        assert_eq!(env["SCRIBE_REGISTRY_ADDR"], "http://127.0.0.1:8500");
        assert_eq!(env["SCRIBE_REGISTRY_AUTH"], "scribe:s3cret");
        assert_eq!(env["SCRIBE_REGISTRY_SSL"], "false");
        assert_eq!(env["SCRIBE_REGISTRY_SSL_VERIFY"], "true");
        assert_eq!(env["SCRIBE_SECRETS_ADDR"], "https://127.0.0.1:8200");
        assert_eq!(env["SCRIBE_SECRETS_SKIP_VERIFY"], "true");
    }

    #[test]
    fn skip_verify_is_omitted_when_verifying() {
        let mut config = base_config();
        config.secrets.tls.verify = true;
        let env = child_env(&config, &HashMap::new());
        assert!(!env.contains_key("SCRIBE_SECRETS_SKIP_VERIFY"));
    }

    #[test]
    fn config_env_overrides_injected_values() {
        let mut config = base_config();
        config
            .env
            .insert("SCRIBE_REGISTRY_ADDR".into(), "http://override:1".into());
        let env = child_env(&config, &HashMap::new());
        assert_eq!(env["SCRIBE_REGISTRY_ADDR"], "http://override:1");
    }

    #[test]
    fn runner_env_wins_over_config_env() {
        let mut config = base_config();
        config.env.insert("SHARED".into(), "from-config".into());
        let runner_env: HashMap<String, String> =
            [("SHARED".to_string(), "from-runner".to_string())].into();
        let env = child_env(&config, &runner_env);
        assert_eq!(env["SHARED"], "from-runner");
    }
}
