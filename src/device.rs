//! Alert and power collaborators driven by the front-end.
//!
//! The monitor never calls into these; the bridge forwards front-end commands
//! here so an alarm app can flash the torch, sound the alarm, and post
//! notifications using the levels it polls.

use anyhow::Result;
use std::time::{Duration, Instant};

/// Vibration waveform looped while the alarm plays: delay, on, off (ms).
pub const VIBRATION_PATTERN_MS: [u64; 3] = [0, 500, 250];

/// Partial wake locks expire on their own after this long.
pub const WAKE_LOCK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Alarm stream volume steps, matching the platform's alarm stream range.
pub const MAX_ALARM_VOLUME: u8 = 7;

const DEFAULT_ALARM_VOLUME: u8 = 4;

/// Platform capabilities used by the alarm front-end.
pub trait DeviceCapabilities: Send {
    fn set_torch(&mut self, on: bool) -> Result<()>;
    /// Start looping the alarm sound at forced max volume, with vibration.
    fn play_alarm(&mut self) -> Result<()>;
    /// Stop the alarm and vibration and restore the saved volume.
    fn stop_alarm(&mut self) -> Result<()>;
    fn notify(&mut self, title: &str, message: &str) -> Result<()>;
    fn acquire_wake_lock(&mut self) -> Result<()>;
    fn release_wake_lock(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
}

/// Stand-in device for hosts without a torch, vibrator, or alarm stream.
///
/// Every call is logged and reflected in inspectable state so front-ends can
/// be exercised end to end on a desktop.
#[derive(Debug)]
pub struct HeadlessDevice {
    has_flash: bool,
    torch_on: bool,
    alarm_playing: bool,
    vibration: Option<[u64; 3]>,
    alarm_volume: u8,
    saved_volume: Option<u8>,
    wake_lock_expires_at: Option<Instant>,
    last_notification: Option<Notification>,
    notifications_sent: usize,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self {
            has_flash: true,
            torch_on: false,
            alarm_playing: false,
            vibration: None,
            alarm_volume: DEFAULT_ALARM_VOLUME,
            saved_volume: None,
            wake_lock_expires_at: None,
            last_notification: None,
            notifications_sent: 0,
        }
    }

    /// Device without a camera flash; torch requests are ignored.
    pub fn without_flash() -> Self {
        Self {
            has_flash: false,
            ..Self::new()
        }
    }

    pub fn torch_on(&self) -> bool {
        self.torch_on
    }

    pub fn alarm_playing(&self) -> bool {
        self.alarm_playing
    }

    pub fn vibrating(&self) -> bool {
        self.vibration.is_some()
    }

    pub fn alarm_volume(&self) -> u8 {
        self.alarm_volume
    }

    pub fn wake_lock_held(&self) -> bool {
        self.wake_lock_expires_at
            .map(|expires_at| Instant::now() < expires_at)
            .unwrap_or(false)
    }

    pub fn last_notification(&self) -> Option<&Notification> {
        self.last_notification.as_ref()
    }

    pub fn notifications_sent(&self) -> usize {
        self.notifications_sent
    }

    fn force_volume(&mut self) {
        self.saved_volume = Some(self.alarm_volume);
        self.alarm_volume = MAX_ALARM_VOLUME;
    }

    fn reset_volume(&mut self) {
        if let Some(saved) = self.saved_volume.take() {
            self.alarm_volume = saved;
        }
    }

    fn start_vibration(&mut self) {
        if self.vibration.is_some() {
            return;
        }
        self.vibration = Some(VIBRATION_PATTERN_MS);
        tracing::debug!(pattern_ms = ?VIBRATION_PATTERN_MS, "vibration started");
    }

    fn stop_vibration(&mut self) {
        if self.vibration.take().is_some() {
            tracing::debug!("vibration stopped");
        }
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceCapabilities for HeadlessDevice {
    fn set_torch(&mut self, on: bool) -> Result<()> {
        if !self.has_flash {
            tracing::debug!("no flash light on device");
            return Ok(());
        }
        self.torch_on = on;
        tracing::info!(on, "torch");
        Ok(())
    }

    fn play_alarm(&mut self) -> Result<()> {
        if self.alarm_playing {
            tracing::debug!("alarm already playing");
            return Ok(());
        }
        self.force_volume();
        self.alarm_playing = true;
        self.start_vibration();
        tracing::info!(volume = self.alarm_volume, "alarm playing");
        Ok(())
    }

    fn stop_alarm(&mut self) -> Result<()> {
        if self.alarm_playing {
            self.alarm_playing = false;
            tracing::info!("alarm stopped");
        }
        self.stop_vibration();
        self.reset_volume();
        Ok(())
    }

    fn notify(&mut self, title: &str, message: &str) -> Result<()> {
        tracing::info!(title, message, "notification");
        // Posts share one notification id, so each replaces the previous one.
        self.last_notification = Some(Notification {
            title: title.to_string(),
            message: message.to_string(),
        });
        self.notifications_sent += 1;
        Ok(())
    }

    fn acquire_wake_lock(&mut self) -> Result<()> {
        if self.wake_lock_held() {
            return Ok(());
        }
        self.wake_lock_expires_at = Some(Instant::now() + WAKE_LOCK_TIMEOUT);
        tracing::debug!(
            timeout_secs = WAKE_LOCK_TIMEOUT.as_secs(),
            "wake lock acquired"
        );
        Ok(())
    }

    fn release_wake_lock(&mut self) -> Result<()> {
        if self.wake_lock_expires_at.take().is_some() {
            tracing::debug!("wake lock released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_forces_max_volume_and_restores_on_stop() {
        let mut device = HeadlessDevice::new();
        assert_eq!(device.alarm_volume(), DEFAULT_ALARM_VOLUME);

        device.play_alarm().expect("play");
        assert!(device.alarm_playing());
        assert!(device.vibrating());
        assert_eq!(device.alarm_volume(), MAX_ALARM_VOLUME);

        device.stop_alarm().expect("stop");
        assert!(!device.alarm_playing());
        assert!(!device.vibrating());
        assert_eq!(device.alarm_volume(), DEFAULT_ALARM_VOLUME);
    }

    #[test]
    fn repeated_play_keeps_original_saved_volume() {
        let mut device = HeadlessDevice::new();
        device.play_alarm().expect("play");
        device.play_alarm().expect("play again");
        device.stop_alarm().expect("stop");
        assert_eq!(device.alarm_volume(), DEFAULT_ALARM_VOLUME);
    }

    #[test]
    fn stop_without_play_leaves_volume_alone() {
        let mut device = HeadlessDevice::new();
        device.stop_alarm().expect("stop");
        assert_eq!(device.alarm_volume(), DEFAULT_ALARM_VOLUME);
    }

    #[test]
    fn torch_toggles_only_with_flash() {
        let mut device = HeadlessDevice::new();
        device.set_torch(true).expect("torch on");
        assert!(device.torch_on());
        device.set_torch(false).expect("torch off");
        assert!(!device.torch_on());

        let mut no_flash = HeadlessDevice::without_flash();
        no_flash.set_torch(true).expect("ignored");
        assert!(!no_flash.torch_on());
    }

    #[test]
    fn notifications_replace_each_other() {
        let mut device = HeadlessDevice::new();
        device.notify("NightShield", "first").expect("notify");
        device.notify("NightShield", "second").expect("notify");
        assert_eq!(device.notifications_sent(), 2);
        assert_eq!(
            device.last_notification(),
            Some(&Notification {
                title: "NightShield".to_string(),
                message: "second".to_string(),
            })
        );
    }

    #[test]
    fn wake_lock_is_idempotent() {
        let mut device = HeadlessDevice::new();
        assert!(!device.wake_lock_held());
        device.acquire_wake_lock().expect("acquire");
        device.acquire_wake_lock().expect("acquire again");
        assert!(device.wake_lock_held());
        device.release_wake_lock().expect("release");
        device.release_wake_lock().expect("release again");
        assert!(!device.wake_lock_held());
    }
}
