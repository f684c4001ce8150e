// src/main.rs
use std::io::{self, BufRead};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use log::{info, warn};

use ecgmon::clock::SystemClock;
use ecgmon::config::MonitorConfig;
use ecgmon::drivers::build_detector;
use ecgmon::engine::{AcquisitionScheduler, ControlHandle};
use ecgmon::types::{EpochStatus, MonitorEvent};

// 终端命令：p 暂停，r 继续，q 停止
fn spawn_console(control: ControlHandle) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let sent = match line.trim() {
                "p" | "pause" => control.pause(),
                "r" | "resume" => control.resume(),
                "q" | "quit" | "stop" => control.stop(),
                "" => true,
                other => {
                    warn!("unknown command {other:?} (p / r / q)");
                    true
                }
            };
            if !sent {
                break;
            }
        }
    });
}

fn fmt_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "--".to_string(), |v| format!("{v:.1}"))
}

fn print_event(event: MonitorEvent) {
    match event {
        MonitorEvent::StateChanged(state) => println!("[state] {state:?}"),
        MonitorEvent::EpochProcessed(epoch) => {
            let latest = epoch.variability_series.last();
            let note = match &epoch.status {
                EpochStatus::Degraded(reason) => format!(" ({reason})"),
                _ => String::new(),
            };
            println!(
                "[{}] epoch {:>4}  beats {:>2}  HR {} bpm  SDNN {} ms  RMSSD {} ms{note}",
                epoch.started_at.format("%H:%M:%S"),
                epoch.index,
                epoch.beats.len(),
                fmt_metric(latest.and_then(|r| r.mean_hr_bpm)),
                fmt_metric(latest.and_then(|r| r.sdnn_ms)),
                fmt_metric(latest.and_then(|r| r.rmssd_ms)),
            );
        }
        MonitorEvent::EpochFailed { index, reason } => {
            println!("[fail] epoch {index:>4}  {reason}")
        }
        MonitorEvent::Stopped(summary) => println!(
            "[done] {} epochs, {} failed, {} degraded, {} saved{}",
            summary.epochs,
            summary.failed,
            summary.degraded,
            summary.persisted,
            if summary.complete { "" } else { " (store incomplete)" }
        ),
    }
}

// 入口函数
fn main() -> Result<()> {
    env_logger::init();
    let config = match std::env::args().nth(1) {
        Some(path) => MonitorConfig::load(Path::new(&path))?,
        None => MonitorConfig::default(),
    };
    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!("cannot create output dir {}", config.output_dir.display())
    })?;

    let detector = build_detector(&config.detector).context("failed to load beat detector")?;
    info!("using beat detector {}", detector.name());
    let device = config.device.clone();
    let mut scheduler =
        AcquisitionScheduler::new(config, detector, Arc::new(SystemClock::new()));

    let printer = scheduler.events().map(|events| {
        thread::spawn(move || {
            for event in events {
                print_event(event);
            }
        })
    });
    spawn_console(scheduler.control());

    scheduler
        .start(device)
        .context("failed to start acquisition")?;
    let outcome = scheduler.run_until_stopped();
    // 关闭事件通道，等待打印线程退出
    drop(scheduler);
    if let Some(handle) = printer {
        handle.join().ok();
    }
    outcome.context("acquisition stopped on error")?;
    Ok(())
}
