//! Drives a [`CaptureScheduler`] on its own thread.
//!
//! The scheduler is built inside the thread by a factory closure, so device
//! backends whose streams are not `Send` still work. The host talks to it
//! through a command channel.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};

use crate::device::AudioDeviceSource;
use crate::scheduler::{AudioSink, CaptureScheduler};
use crate::stats::CaptureStatsHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum RunnerCommand {
    Start,
    Stop { push_remaining: bool },
    Push,
    SetAutoPush(bool),
    SetBlocked(bool),
    SwitchDevice(String),
}

pub struct CaptureRunner {
    commands: Sender<RunnerCommand>,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    stats: CaptureStatsHandle,
}

impl CaptureRunner {
    /// Build a scheduler with `factory` on a new thread and tick it every
    /// `tick_interval`. Fails when the factory fails.
    pub fn spawn<D, S, F>(factory: F, tick_interval: Duration) -> Result<Self>
    where
        D: AudioDeviceSource + 'static,
        S: AudioSink + 'static,
        F: FnOnce() -> Result<CaptureScheduler<D, S>> + Send + 'static,
    {
        let (commands, command_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded(1);
        let (ready_tx, ready_rx) = bounded(1);

        let thread = std::thread::Builder::new()
            .name("micloop-capture".to_string())
            .spawn(move || {
                let scheduler = match factory() {
                    Ok(scheduler) => {
                        let _ = ready_tx.send(Ok(scheduler.stats()));
                        scheduler
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run(scheduler, command_rx, stop_rx, tick_interval);
            })?;

        let stats = match ready_rx.recv() {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(anyhow!("capture thread exited during startup"));
            }
        };

        Ok(Self {
            commands,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            stats,
        })
    }

    pub fn send(&self, command: RunnerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("capture thread is not running"))
    }

    pub fn stats(&self) -> CaptureStatsHandle {
        self.stats.clone()
    }

    /// Shut the scheduler down and wait for the thread.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<D: AudioDeviceSource, S: AudioSink>(
    mut scheduler: CaptureScheduler<D, S>,
    commands: Receiver<RunnerCommand>,
    stop_rx: Receiver<()>,
    tick_interval: Duration,
) {
    let mut last_tick = Instant::now();
    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(commands) -> msg => match msg {
                Ok(command) => apply(&mut scheduler, command),
                Err(_) => break,
            },
            default(tick_interval) => {}
        }
        let now = Instant::now();
        if now.duration_since(last_tick) >= tick_interval {
            scheduler.tick(now.duration_since(last_tick).as_secs_f32());
            last_tick = now;
        }
    }
    scheduler.shutdown();
    log::debug!("Capture thread finished");
}

fn apply<D: AudioDeviceSource, S: AudioSink>(scheduler: &mut CaptureScheduler<D, S>, command: RunnerCommand) {
    match command {
        RunnerCommand::Start => scheduler.start_recording(),
        RunnerCommand::Stop { push_remaining } => scheduler.stop_recording(push_remaining),
        RunnerCommand::Push => scheduler.push_audio(),
        RunnerCommand::SetAutoPush(on) => scheduler.set_auto_push(on),
        RunnerCommand::SetBlocked(on) => scheduler.set_blocked(on),
        RunnerCommand::SwitchDevice(name) => {
            if let Err(e) = scheduler.switch_device(&name) {
                log::warn!("Failed to switch to {}: {}", name, e);
            }
        }
    }
}
