//! Per-template render dampening.
//!
//! A quiescence record delays a template's render until its updates have
//! settled for `min`, but never past `max` after the first update of the
//! burst. The timer task holds only the fire-at channel and the template id;
//! the runner owns the record and deletes it when the fire is consumed.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use scribe_template::TemplateId;

/// Dampening state for one template.
#[derive(Debug)]
pub struct Quiescence {
    id: TemplateId,
    min: Duration,
    max: Duration,
    ch: mpsc::Sender<TemplateId>,
    /// Absolute ceiling for the current burst; set on the first tick.
    deadline: Option<Instant>,
    /// Fire-at instant consumed by the timer task; present once armed.
    fire_tx: Option<watch::Sender<Instant>>,
}

impl Quiescence {
    pub fn new(ch: mpsc::Sender<TemplateId>, min: Duration, max: Duration, id: TemplateId) -> Self {
        Self {
            id,
            min,
            max,
            ch,
            deadline: None,
            fire_tx: None,
        }
    }

    /// Register an update for this template.
    ///
    /// The first tick arms a timer for `min` and fixes the burst deadline at
    /// `now + max`. Later ticks snooze the timer by `min`, clamped to the
    /// deadline. Once the deadline has passed, a pending fire is left alone:
    /// the channel delivery is authoritative and the runner deletes this
    /// record when it consumes it.
    pub fn tick(&mut self) {
        let now = Instant::now();

        let Some(fire_tx) = &self.fire_tx else {
            let deadline = now + self.max;
            self.deadline = Some(deadline);

            let (fire_tx, fire_rx) = watch::channel(now + self.min);
            tokio::spawn(fire_timer(self.id.clone(), fire_rx, self.ch.clone()));
            self.fire_tx = Some(fire_tx);
            return;
        };
        let Some(deadline) = self.deadline else {
            return;
        };

        if now + self.min <= deadline {
            let _ = fire_tx.send(now + self.min);
        } else if deadline > now {
            let _ = fire_tx.send(deadline);
        }
        // deadline reached: the timer has fired or is about to
    }
}

/// Sleep until the (resettable) fire instant, then post the template id.
async fn fire_timer(
    id: TemplateId,
    mut fire_rx: watch::Receiver<Instant>,
    ch: mpsc::Sender<TemplateId>,
) {
    loop {
        let fire_at = *fire_rx.borrow_and_update();
        tokio::select! {
            _ = tokio::time::sleep_until(fire_at) => {
                tracing::debug!(template = %id, "quiescence timer fired");
                let _ = ch.send(id).await;
                return;
            }
            changed = fire_rx.changed() => {
                if changed.is_err() {
                    // record dropped before firing
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::advance;

    fn quiescence(
        min_ms: u64,
        max_ms: u64,
    ) -> (Quiescence, mpsc::Receiver<TemplateId>, TemplateId) {
        let (tx, rx) = mpsc::channel(1);
        let id = scribe_template::Template::new(scribe_template::NewTemplateInput {
            contents: Some("x".into()),
            ..Default::default()
        })
        .unwrap()
        .id()
        .clone();
        let q = Quiescence::new(
            tx,
            Duration::from_millis(min_ms),
            Duration::from_millis(max_ms),
            id.clone(),
        );
        (q, rx, id)
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn fires_min_after_a_single_tick() {
        let (mut q, mut rx, id) = quiescence(50, 200);
        q.tick();

        advance(Duration::from_millis(49)).await;
        assert!(rx.try_recv().is_err(), "must not fire before min");

        advance(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(rx.try_recv().unwrap(), id);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn later_ticks_snooze_the_timer() {
        let (mut q, mut rx, id) = quiescence(50, 500);
        q.tick();

        for _ in 0..3 {
            advance(Duration::from_millis(40)).await;
            q.tick();
            assert!(rx.try_recv().is_err(), "each tick resets the min window");
        }

        advance(Duration::from_millis(51)).await;
        tokio::task::yield_now().await;
        assert_eq!(rx.try_recv().unwrap(), id);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn fires_no_later_than_max_under_constant_ticks() {
        let (mut q, mut rx, id) = quiescence(50, 200);
        let started = Instant::now();
        q.tick();

        let mut fired = None;
        // keep ticking every 40ms, well inside min, until the fire arrives
        for _ in 0..10 {
            advance(Duration::from_millis(40)).await;
            tokio::task::yield_now().await;
            if let Ok(got) = rx.try_recv() {
                fired = Some((got, started.elapsed()));
                break;
            }
            q.tick();
        }

        let (got, elapsed) = fired.expect("quiescence must fire by max");
        assert_eq!(got, id);
        assert!(
            elapsed >= Duration::from_millis(200) && elapsed <= Duration::from_millis(240),
            "fired at {elapsed:?}, expected within one tick of max"
        );
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn ticks_after_the_deadline_leave_the_pending_fire() {
        let (mut q, mut rx, id) = quiescence(50, 60);
        q.tick();

        // cross the deadline without letting the timer run
        advance(Duration::from_millis(59)).await;
        q.tick();
        q.tick();

        advance(Duration::from_millis(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(rx.try_recv().unwrap(), id, "deadline delivery is authoritative");
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn dropping_the_record_cancels_the_timer() {
        let (mut q, mut rx, _id) = quiescence(50, 200);
        q.tick();
        drop(q);

        advance(Duration::from_millis(300)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
