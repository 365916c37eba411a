//! Desktop notifications for tsuzuki
//!
//! Sent at the end of a pass for:
//! - Episodes handed to the downloader
//! - Series that could not be checked

use notify_rust::Notification;
use tracing::{debug, warn};

use crate::library::models::EpisodeNumber;

const APP_NAME: &str = "Tsuzuki";

pub struct Notifier {
    enabled: bool,
}

impl Notifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn episode_downloaded(&self, series_title: &str, episode: EpisodeNumber) {
        if !self.enabled {
            return;
        }

        let body = format!("Episode {} is on its way", episode);
        self.send(series_title, &body);
    }

    pub fn series_failed(&self, count: usize) {
        if !self.enabled || count == 0 {
            return;
        }

        let body = format!("{} series could not be checked, see the log", count);
        self.send("Reconciliation incomplete", &body);
    }

    fn send(&self, summary: &str, body: &str) {
        debug!(summary = %summary, body = %body, "Sending notification");

        let result = Notification::new()
            .appname(APP_NAME)
            .summary(summary)
            .body(body)
            .timeout(5000)
            .show();

        if let Err(e) = result {
            warn!("Failed to send notification: {}", e);
        }
    }
}
