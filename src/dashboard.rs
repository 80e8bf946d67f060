//! Console dashboard: periodic snapshot printout plus operator commands on stdin.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::broker::BrokerGateway;
use crate::trading::{ControlSurface, DashboardSnapshot, PositionRow};

/// Operator commands accepted on stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Pause,
    Resume,
    CloseAll,
    Slave(u64),
    Quit,
    Help,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let command = match parts.next()?.to_lowercase().as_str() {
            "pause" => ConsoleCommand::Pause,
            "resume" => ConsoleCommand::Resume,
            "close-all" | "closeall" => ConsoleCommand::CloseAll,
            "slave" => ConsoleCommand::Slave(parts.next()?.parse().ok()?),
            "quit" | "exit" => ConsoleCommand::Quit,
            "help" | "?" => ConsoleCommand::Help,
            _ => return None,
        };
        Some(command)
    }
}

const HELP: &str = "Commands: pause | resume | close-all | slave <login> | quit";

/// Run the dashboard until `quit`, Ctrl+C, or shutdown.
///
/// Sets `shutdown` on exit so the engine loop stops too.
pub async fn run<G: BrokerGateway + 'static>(
    control: ControlSurface<G>,
    refresh: Duration,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let (stop_tx, stop) = watch::channel(false);

    // Register shutdown handler once for the whole session
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        println!("\nStopping...");
        signal_shutdown.store(true, Ordering::SeqCst);
        stop_tx.send(true).ok();
    });

    let (lines_tx, lines) = mpsc::unbounded_channel();
    tokio::spawn(read_stdin(lines_tx));

    println!("{}", HELP);
    serve(Arc::new(control), refresh, lines, stop, shutdown).await
}

/// Forward stdin lines until it closes.
async fn read_stdin(lines_tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if lines_tx.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                break;
            }
        }
    }
}

/// Refresh on its own task and handle console lines as they arrive.
///
/// A slow snapshot never delays a command.
async fn serve<G: BrokerGateway + 'static>(
    control: Arc<ControlSurface<G>>,
    refresh: Duration,
    mut lines: mpsc::UnboundedReceiver<String>,
    mut stop: watch::Receiver<bool>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let refresher = tokio::spawn(refresh_loop(control.clone(), refresh, shutdown.clone()));
    let mut stdin_open = true;
    let mut stop_open = true;

    while !shutdown.load(Ordering::SeqCst) {
        tokio::select! {
            changed = stop.changed(), if stop_open => {
                match changed {
                    Ok(()) if *stop.borrow() => break,
                    Ok(()) => {}
                    Err(_) => stop_open = false,
                }
            }
            line = lines.recv(), if stdin_open => {
                match line {
                    Some(line) => {
                        if !handle_line(&control, &line).await {
                            break;
                        }
                    }
                    None => stdin_open = false,
                }
            }
            else => break,
        }
    }

    shutdown.store(true, Ordering::SeqCst);
    refresher.abort();
    Ok(())
}

async fn refresh_loop<G: BrokerGateway>(control: Arc<ControlSurface<G>>, refresh: Duration, shutdown: Arc<AtomicBool>) {
    let mut ticker = interval(refresh);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while !shutdown.load(Ordering::SeqCst) {
        ticker.tick().await;
        let snapshot = control.snapshot().await;
        print!("{}", render(&snapshot));
    }
}

/// Returns `false` when the operator asked to quit.
async fn handle_line<G: BrokerGateway>(control: &ControlSurface<G>, line: &str) -> bool {
    if line.trim().is_empty() {
        return true;
    }

    match ConsoleCommand::parse(line) {
        Some(ConsoleCommand::Pause) => {
            control.pause();
            println!("Copier paused.");
        }
        Some(ConsoleCommand::Resume) => {
            control.resume();
            println!("Copier resumed.");
        }
        Some(ConsoleCommand::CloseAll) => match control.close_all() {
            Ok(()) => println!("Close-all queued; runs on the next cycle."),
            Err(e) => println!("Close-all failed: {}", e),
        },
        Some(ConsoleCommand::Slave(login)) => match control.slave_positions(login).await {
            Ok(rows) => print!("{}", render_positions(&format!("Slave {} Positions", login), &rows)),
            Err(e) => println!("Cannot read slave {}: {:#}", login, e),
        },
        Some(ConsoleCommand::Quit) => {
            info!("Quit requested from console");
            return false;
        }
        Some(ConsoleCommand::Help) | None => println!("{}", HELP),
    }

    true
}

pub fn render(snapshot: &DashboardSnapshot) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "\n=== Trade Replicator [{}] ===", snapshot.taken_at.format("%H:%M:%S"));
    let state = if snapshot.paused { "PAUSED" } else { snapshot.run_state.as_str() };
    let _ = writeln!(out, "Engine:           {}", state);
    let last_poll = snapshot
        .last_poll_ok_at
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "Never".to_string());
    if snapshot.engine_stale {
        let _ = writeln!(out, "Last Master Poll: {} (NO RECENT CONNECTIVITY)", last_poll);
    } else {
        let _ = writeln!(out, "Last Master Poll: {}", last_poll);
    }

    match &snapshot.master {
        Some(master) => {
            let _ = writeln!(out, "\n--- Master {} ---", master.login);
            let _ = writeln!(out, "Balance:          {:.2}", master.balance);
            let _ = writeln!(out, "Equity:           {:.2}", master.equity);
            let _ = writeln!(out, "Daily Drawdown:   {:.2}%", master.drawdown_pct);
            out.push_str(&render_positions("Master Positions", &master.positions));
        }
        None => {
            let _ = writeln!(out, "\n--- Master unreachable ---");
            if let Some(last) = &snapshot.engine_master {
                let _ = writeln!(out, "Last Balance:     {:.2}", last.balance);
                let _ = writeln!(out, "Last Equity:      {:.2}", last.equity);
            }
        }
    }

    let _ = writeln!(
        out,
        "\n{:<12} {:>14} {:>6} {:>12} {:<12}",
        "SLAVE", "BALANCE", "OPEN", "P&L", "STATUS"
    );
    let _ = writeln!(out, "{}", "-".repeat(60));
    for slave in &snapshot.slaves {
        let balance = slave
            .balance
            .map(|b| format!("{:.2}", b))
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:<12} {:>14} {:>6} {:>12.2} {:<12}",
            slave.login,
            balance,
            slave.open_count,
            slave.total_profit,
            slave.status.to_string()
        );
    }

    out
}

fn render_positions(title: &str, rows: &[PositionRow]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n--- {} ({}) ---", title, rows.len());
    if rows.is_empty() {
        let _ = writeln!(out, "  (flat)");
        return out;
    }

    let _ = writeln!(
        out,
        "{:<10} {:<10} {:<5} {:>8} {:>12} {:>10} {:<8}",
        "TICKET", "SYMBOL", "SIDE", "VOLUME", "OPEN", "P&L", "STATUS"
    );
    for row in rows {
        let p = &row.position;
        let _ = writeln!(
            out,
            "{:<10} {:<10} {:<5} {:>8} {:>12} {:>10.2} {:<8}",
            p.ticket.to_string(),
            truncate(&p.symbol, 10),
            p.direction.as_str(),
            p.volume.to_string(),
            p.open_price.to_string(),
            p.profit,
            row.status.to_string()
        );
    }
    out
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
