//! Spawns the units that run their own background loop: the sync loop
//! (C8) always, the SAN reconciler (C7) and certificate renewal timer (C6)
//! only when a real ACME authority is configured, and a unit that logs
//! every [`Update`] event onto the tracing subscriber.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::center::{Center, Update};
use std::sync::Arc;

/// Spawn every background unit `center` needs and return their join
/// handles. The caller is expected to hold these for the process lifetime
/// and to abort them on shutdown.
pub fn spawn_units(center: Arc<Center>, updates_rx: mpsc::UnboundedReceiver<Update>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    handles.push(spawn_sync_loop(center.clone()));

    if let Some(acme) = center.acme.clone() {
        handles.push(spawn_san_reconciler(center.clone()));
        handles.push(spawn_renewal_timer(center.clone(), acme));
    }

    handles.push(spawn_update_logger(updates_rx));

    handles
}

fn spawn_sync_loop(center: Arc<Center>) -> JoinHandle<()> {
    tokio::spawn(async move {
        center
            .sync
            .clone()
            .run(center.metrics.sync.clone(), center.metrics.zone.clone())
            .await;
    })
}

fn spawn_san_reconciler(center: Arc<Center>) -> JoinHandle<()> {
    tokio::spawn(async move {
        center
            .san
            .clone()
            .run(center.metrics.acme.clone(), center.metrics.zone.clone())
            .await;
    })
}

/// Periodically asks the ACME Coordinator whether the current certificate
/// needs renewing. `AcmeCoordinator::renew_if_due` already no-ops outside
/// the renew-before window, so this timer can run on a fixed, fairly tight
/// interval without causing needless ACME traffic.
fn spawn_renewal_timer(center: Arc<Center>, acme: Arc<crate::acme::AcmeCoordinator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let result = acme
                .renew_if_due(&center.metrics.acme, &center.metrics.zone)
                .await;
            let sans = acme.status().await.current_sans;
            let error = result.as_ref().err().map(ToString::to_string);
            if let Err(err) = &result {
                tracing::warn!(error = %err, "certificate renewal check failed");
            }
            let _ = center.updates.send(Update::CertificateRenewalAttempted { sans, error });
        }
    })
}

fn spawn_update_logger(mut updates_rx: mpsc::UnboundedReceiver<Update>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = updates_rx.recv().await {
            match update {
                Update::RecordCreated { fqdn, proxied } => {
                    tracing::info!(fqdn = %fqdn, proxied, "record created");
                }
                Update::RecordRemoved { fqdn } => {
                    tracing::info!(fqdn = %fqdn, "record removed");
                }
                Update::CertificateRenewalAttempted { sans, error } => match error {
                    Some(error) => tracing::warn!(sans = ?sans, error = %error, "certificate renewal attempt failed"),
                    None => tracing::debug!(sans = ?sans, "certificate renewal check completed"),
                },
            }
        }
    })
}
