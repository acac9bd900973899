use crate::lifecycle::PollManager;
use log::{error, info};
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};

// Background sweep: ends polls whose timer was lost (restart, another
// replica created them) and purges ended polls past tier retention.
pub async fn check_expired_polls_task(manager: PollManager, period: Duration) {
    info!("Starting background sweep every {}s", period.as_secs());
    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await; // Wait for the next interval tick

        match manager.sweep().await {
            Ok((0, 0)) => {}
            Ok((ended, purged)) => {
                info!("Sweep ended {} overdue poll(s), purged {} expired record(s)", ended, purged);
            }
            Err(e) => {
                error!("Poll sweep failed: {}", e);
            }
        }
    }
}
