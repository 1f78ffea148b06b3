//! Network reachability monitor
//!
//! Periodically dials a well-known host and reports when reachability
//! changes, so the supervisor can recover feeds without waiting for the
//! watchdog.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use quakefeed_connector_lib::NetworkEvent;

/// Event to emit when reachability goes from `previous` to `now`.
/// The first observation only reports a loss.
pub fn transition(previous: Option<bool>, now: bool) -> Option<NetworkEvent> {
    match (previous, now) {
        (Some(false), true) => Some(NetworkEvent::Available),
        (Some(true), false) | (None, false) => Some(NetworkEvent::Lost),
        _ => None,
    }
}

async fn reachable(addr: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

pub fn spawn_monitor(
    probe_addr: String,
    period: Duration,
    events: mpsc::Sender<NetworkEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut previous = None;
        info!(probe = %probe_addr, period_secs = period.as_secs(), "Network monitor started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let now = tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        now = reachable(&probe_addr, period) => now,
                    };
                    if let Some(event) = transition(previous, now) {
                        info!(?event, probe = %probe_addr, "Network reachability changed");
                        if events.send(event).await.is_err() {
                            debug!("Network event receiver gone");
                            break;
                        }
                    }
                    previous = Some(now);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition() {
        assert_eq!(transition(None, true), None);
        assert_eq!(transition(None, false), Some(NetworkEvent::Lost));
        assert_eq!(transition(Some(true), true), None);
        assert_eq!(transition(Some(true), false), Some(NetworkEvent::Lost));
        assert_eq!(transition(Some(false), false), None);
        assert_eq!(transition(Some(false), true), Some(NetworkEvent::Available));
    }

    #[tokio::test]
    async fn test_reachable_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(reachable(&addr, Duration::from_secs(2)).await);

        drop(listener);
        assert!(!reachable(&addr, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_pending_dial() {
        // Non-routable address: the dial hangs until its timeout
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = spawn_monitor(
            "10.255.255.1:9".to_string(),
            Duration::from_secs(30),
            events_tx,
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), monitor)
            .await
            .expect("monitor did not stop while dialing")
            .unwrap();
    }
}
