use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;

use crate::types::Treatment;

/// Pick a treatment the way customers do: mostly basic, premium rarely.
pub fn random_treatment<R: Rng + ?Sized>(rng: &mut R) -> Treatment {
    let weighted = [
        (Treatment::Basic, 6),
        (Treatment::Standard, 3),
        (Treatment::Premium, 1),
    ];
    weighted
        .choose_weighted(rng, |(_, weight)| *weight)
        .map(|(treatment, _)| *treatment)
        .unwrap_or(Treatment::Basic)
}

/// Producer task standing in for the front-panel buttons. Sends one press per
/// `interval` until the receiving side goes away.
pub async fn treatment_presses(tx: mpsc::Sender<Treatment>, interval: Duration) {
    let mut ticker = time::interval(interval);
    // The first tick completes immediately; skip it so boot is not a press.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let treatment = random_treatment(&mut rand::thread_rng());
        log::debug!("Simulated button press: {}", treatment);
        if tx.send(treatment).await.is_err() {
            log::info!("Device loop gone, stopping button simulator");
            return;
        }
    }
}
