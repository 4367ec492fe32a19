use std::io::{self, BufRead};

use anyhow::Result;
use log::{error, info};

use sugarboat_rs::ble::{BleLink, BleLinkConfig};
use sugarboat_rs::session::DeviceSession;
use sugarboat_rs::types::{Coeffs, Config, DeviceEvent};

#[tokio::main]
async fn main() -> Result<()> {
    // Set RUST_LOG=sugarboat_rs=debug for verbose output.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let link = BleLink::new(BleLinkConfig::default());
    let (session, mut events) = DeviceSession::spawn(link);

    info!("Connecting to hydrometer …");
    session.connect().await;

    info!("Commands (type + Enter):");
    info!("  q                 – quit");
    info!("  c                 – connect");
    info!("  d                 – disconnect");
    info!("  i                 – calibrate IMU (keep the device level and still)");
    info!("  r0 / r1           – realtime streaming off / on");
    info!("  coeffs A2 A1 A0   – upload Brix coefficients\n");

    // Read stdin on a dedicated OS thread to avoid holding a non-Send
    // StdinLock across await points.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // The latest device config, used to gate coefficient edits: the
    // calibration form is only meaningful once the device reports that it
    // holds valid coefficients.
    let mut config: Option<Config> = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    DeviceEvent::Connected(name) => info!("Connected to {name}"),
                    DeviceEvent::Disconnected => {
                        info!("Disconnected.");
                        config = None;
                    }
                    DeviceEvent::ConnectFailed(reason) => error!("Connect failed: {reason}"),
                    DeviceEvent::Orientation(o) => {
                        println!(
                            "[ORIENT] quat=({:+.3}, {:+.3}, {:+.3}, {:+.3})  psi={:+.2} theta={:+.2} phi={:+.2}",
                            o.quaternion.x, o.quaternion.y, o.quaternion.z, o.quaternion.w,
                            o.euler.psi, o.euler.theta, o.euler.phi,
                        );
                    }
                    DeviceEvent::SensorData(s) => {
                        println!(
                            "[SENSOR] angle={:.1}°  brix={:.2} °Bx  sg={:.4}  temp={:.1} °C  rh={:.0}%  batt={:.2} V",
                            s.angle_deg, s.brix, s.sg, s.temp_celsius, 100.0 * s.rel_humidity, s.batt_voltage,
                        );
                    }
                    DeviceEvent::Config(c) => {
                        println!(
                            "[CONFIG] v{}  imu_offsets={}  coeffs={}  a2={} a1={} a0={}",
                            c.version, c.has_imu_offsets, c.has_coeffs,
                            c.coeffs.a2, c.coeffs.a1, c.coeffs.a0,
                        );
                        config = Some(c);
                    }
                    DeviceEvent::CommandAck(kind) => info!("Command {kind:?} acknowledged"),
                    DeviceEvent::CommandFailed(kind, reason) => {
                        error!("Command {kind:?} failed: {reason}")
                    }
                    DeviceEvent::ConfigRefreshFailed(reason) => {
                        error!("Config re-read failed: {reason}")
                    }
                    DeviceEvent::DecodeError { channel, reason } => {
                        error!("Bad packet on {channel}: {reason}")
                    }
                }
            }
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                match line.as_str() {
                    "" => {}
                    "q" => {
                        session.disconnect().await;
                        break;
                    }
                    "c" => session.connect().await,
                    "d" => session.disconnect().await,
                    "i" => session.calibrate_imu().await,
                    "r0" => session.set_realtime_run(false).await,
                    "r1" => session.set_realtime_run(true).await,
                    cmd if cmd.starts_with("coeffs") => {
                        if !config.as_ref().is_some_and(|c| c.has_coeffs) {
                            error!("Device has not reported valid coefficients yet");
                            continue;
                        }
                        match parse_coeffs(cmd) {
                            Some(coeffs) => session.set_coeffs(coeffs).await,
                            None => error!("Usage: coeffs A2 A1 A0"),
                        }
                    }
                    other => error!("Unknown command: '{other}'"),
                }
            }
        }
    }

    info!("Event loop finished – exiting.");
    Ok(())
}

fn parse_coeffs(line: &str) -> Option<Coeffs> {
    let mut parts = line.split_whitespace().skip(1);
    let a2 = parts.next()?.parse().ok()?;
    let a1 = parts.next()?.parse().ok()?;
    let a0 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(Coeffs { a2, a1, a0 })
}
