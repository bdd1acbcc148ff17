//! Scripted switch regime standing in for the physical board

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::board::{AlarmsBoard, SwitchEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegimeStep {
    pub event: SwitchEvent,
    /// Pause after the event
    pub delay: Duration,
}

#[derive(Debug, Clone)]
pub struct VirtualBoard {
    name: String,
    steps: Vec<RegimeStep>,
}

impl VirtualBoard {
    pub fn new(name: impl Into<String>, steps: Vec<RegimeStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Every switch on in order, then off in the same order
    pub fn local_alarms_regime<S: AsRef<str>>(sids: &[S], interval: Duration) -> Self {
        let on = sids.iter().map(|sid| SwitchEvent::new(sid.as_ref(), true));
        let off = sids.iter().map(|sid| SwitchEvent::new(sid.as_ref(), false));
        let events: Vec<SwitchEvent> = on.chain(off).collect();
        let last = events.len().saturating_sub(1);

        let steps = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| RegimeStep {
                event,
                delay: if i == last { Duration::ZERO } else { interval },
            })
            .collect();

        Self::new("local-alarms", steps)
    }

    pub fn steps(&self) -> &[RegimeStep] {
        &self.steps
    }

    /// Feed the regime into the board; returns the number of events played
    pub async fn play(&self, board: &AlarmsBoard, cancel: &CancellationToken) -> usize {
        info!("Regime {} begun ({} steps)", self.name, self.steps.len());
        let mut played = 0;

        for step in &self.steps {
            if cancel.is_cancelled() {
                break;
            }
            match board.handle_switch(&step.event) {
                Ok(change) => debug!(
                    "Regime {} {}={} -> {:?}",
                    self.name,
                    step.event.switch_id,
                    step.event.on,
                    change.map(|c| c.kind)
                ),
                Err(e) => warn!("Regime {} step {}: {}", self.name, step.event.switch_id, e),
            }
            played += 1;

            if !step.delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(step.delay) => {},
                }
            }
        }

        info!("Regime {} ended after {} steps", self.name, played);
        played
    }
}
