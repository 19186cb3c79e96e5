//! Pushes the stored relay states and AGC settings to the hardware.
//!
//! The web UI drives relays directly for immediate feedback; this loop keeps
//! the hardware in line with the persisted record, most notably after boot.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::record::{AudioSettings, SettingsRecord, decode};
use crate::store::SettingsStore;

/// Board-side actuation: relay GPIOs and the audio gain control.
pub trait ControlEffector: Send + Sync {
    fn set_relay(&self, pin: u8, on: bool);
    fn set_agc(&self, audio: AudioSettings);
}

/// Effector for hosts without relays. Only logs the commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEffector;

impl ControlEffector for LoggingEffector {
    fn set_relay(&self, pin: u8, on: bool) {
        info!("Relay on GPIO {} -> {}", pin, if on { "on" } else { "off" });
    }

    fn set_agc(&self, audio: AudioSettings) {
        info!(
            "AGC wake word={} audio={} level={:?}",
            audio.wake_word_agc, audio.audio_agc, audio.agc_level
        );
    }
}

pub struct ControlSync {
    store: Arc<SettingsStore>,
    effector: Arc<dyn ControlEffector>,
    applied: Option<SettingsRecord>,
}

impl ControlSync {
    pub fn new(store: Arc<SettingsStore>, effector: Arc<dyn ControlEffector>) -> Self {
        Self {
            store,
            effector,
            applied: None,
        }
    }

    /// Reads the store once and applies whatever changed since the last poll.
    ///
    /// Returns the number of commands sent to the effector. A relay whose slot
    /// moved to another pin, or lost its pin, is switched off first unless a
    /// slot still drives it. Slots without a pin are otherwise skipped.
    pub fn poll(&mut self) -> usize {
        let Some(raw) = self.store.load() else {
            return 0;
        };
        let record = decode(&raw);
        let mut commands = 0;

        if let Some(applied) = &self.applied {
            for (previous, slot) in applied.devices.iter().zip(&record.devices) {
                let Some(old_pin) = previous.pin else {
                    continue;
                };
                let still_driven = record.devices.iter().any(|d| d.pin == Some(old_pin));
                if previous.pin != slot.pin && previous.on && !still_driven {
                    self.effector.set_relay(old_pin, false);
                    commands += 1;
                }
            }
        }

        for (i, slot) in record.devices.iter().enumerate() {
            let Some(pin) = slot.pin else {
                continue;
            };
            let unchanged = self.applied.as_ref().is_some_and(|applied| {
                applied.devices[i].pin == slot.pin && applied.devices[i].on == slot.on
            });
            if !unchanged {
                self.effector.set_relay(pin, slot.on);
                commands += 1;
            }
        }

        if self.applied.as_ref().map(|applied| applied.audio) != Some(record.audio) {
            self.effector.set_agc(record.audio);
            commands += 1;
        }

        self.applied = Some(record);
        commands
    }

    /// Polls every `period` until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut sync = self;
        info!("Control sync started (every {:?})", period);
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let polled = tokio::task::spawn_blocking(move || {
                        let commands = sync.poll();
                        (sync, commands)
                    })
                    .await;
                    match polled {
                        Ok((polled_sync, commands)) => {
                            sync = polled_sync;
                            if commands > 0 {
                                debug!("Control sync sent {} commands", commands);
                            }
                        }
                        Err(e) => {
                            error!("Control sync stopped: {}", e);
                            return;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Control sync stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DeviceSlot, encode};
    use crate::store::MemoryKvStore;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Command {
        Relay(u8, bool),
        Agc(AudioSettings),
    }

    #[derive(Default)]
    struct FakeEffector {
        commands: Mutex<Vec<Command>>,
    }

    impl FakeEffector {
        fn take(&self) -> Vec<Command> {
            std::mem::take(&mut *self.commands.lock())
        }
    }

    impl ControlEffector for FakeEffector {
        fn set_relay(&self, pin: u8, on: bool) {
            self.commands.lock().push(Command::Relay(pin, on));
        }

        fn set_agc(&self, audio: AudioSettings) {
            self.commands.lock().push(Command::Agc(audio));
        }
    }

    fn setup() -> (Arc<SettingsStore>, Arc<FakeEffector>, ControlSync) {
        let store = Arc::new(SettingsStore::new(Arc::new(MemoryKvStore::new())));
        let effector = Arc::new(FakeEffector::default());
        let sync = ControlSync::new(store.clone(), effector.clone());
        (store, effector, sync)
    }

    fn record(states: [bool; 2], level: u8) -> SettingsRecord {
        SettingsRecord {
            devices: [
                DeviceSlot::new("Light", Some(5), states[0]),
                DeviceSlot::new("Fan", Some(6), states[1]),
                DeviceSlot::new("Spare", None, true),
                DeviceSlot::default(),
            ],
            audio: AudioSettings {
                wake_word_agc: true,
                audio_agc: false,
                agc_level: Some(level),
            },
        }
    }

    #[test]
    fn test_nothing_stored() {
        let (_store, effector, mut sync) = setup();
        assert_eq!(sync.poll(), 0);
        assert!(effector.take().is_empty());
    }

    #[test]
    fn test_first_poll_applies_everything() {
        let (store, effector, mut sync) = setup();
        store.save(&encode(&record([true, false], 70))).unwrap();

        assert_eq!(sync.poll(), 3);
        assert_eq!(
            effector.take(),
            vec![
                Command::Relay(5, true),
                Command::Relay(6, false),
                Command::Agc(record([true, false], 70).audio),
            ]
        );
    }

    #[test]
    fn test_only_changes_are_applied() {
        let (store, effector, mut sync) = setup();
        store.save(&encode(&record([true, false], 70))).unwrap();
        sync.poll();
        effector.take();

        assert_eq!(sync.poll(), 0);

        store.save(&encode(&record([true, true], 70))).unwrap();
        assert_eq!(sync.poll(), 1);
        assert_eq!(effector.take(), vec![Command::Relay(6, true)]);

        store.save(&encode(&record([true, true], 40))).unwrap();
        assert_eq!(sync.poll(), 1);
        assert!(matches!(effector.take().as_slice(), [Command::Agc(_)]));
    }

    #[test]
    fn test_moved_or_cleared_pin_switches_old_relay_off() {
        let (store, effector, mut sync) = setup();
        let mut current = record([true, false], 70);
        store.save(&encode(&current)).unwrap();
        sync.poll();
        effector.take();

        current.devices[0].pin = Some(7);
        store.save(&encode(&current)).unwrap();
        assert_eq!(sync.poll(), 2);
        assert_eq!(
            effector.take(),
            vec![Command::Relay(5, false), Command::Relay(7, true)]
        );

        current.devices[0].pin = None;
        store.save(&encode(&current)).unwrap();
        assert_eq!(sync.poll(), 1);
        assert_eq!(effector.take(), vec![Command::Relay(7, false)]);

        // Nothing left to release.
        assert_eq!(sync.poll(), 0);
    }

    #[test]
    fn test_pin_taken_over_by_other_slot_is_not_released() {
        let (store, effector, mut sync) = setup();
        let mut current = record([true, true], 70);
        store.save(&encode(&current)).unwrap();
        sync.poll();
        effector.take();

        // Slot 1 gives up pin 5, slot 2 moves onto it.
        current.devices[0].pin = None;
        current.devices[1].pin = Some(5);
        store.save(&encode(&current)).unwrap();
        sync.poll();
        assert_eq!(
            effector.take(),
            vec![Command::Relay(6, false), Command::Relay(5, true)]
        );
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let (store, effector, sync) = setup();
        store.save(&encode(&record([false, true], 10))).unwrap();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(sync.run(Duration::from_millis(10), rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        assert!(effector.take().contains(&Command::Relay(6, true)));
    }
}
