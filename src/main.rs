#![deny(clippy::all)]
#![warn(clippy::pedantic)]

use std::io::{self, IsTerminal as _};

use anyhow::anyhow;
use log::{error, info, warn};
use tracing_subscriber::{
    filter::LevelFilter,
    layer::{Layer as _, SubscriberExt as _},
    util::SubscriberInitExt as _,
};

use rental_engine::{
    clock::ManualClock,
    engine::RentalEngine,
    ledger::InMemoryLedger,
    replay::{self, Command},
};

// Diagnostics go to stderr so stdout stays a clean CSV of the final books.
// `log` records are bridged into the subscriber.
fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(io::stderr().is_terminal())
                .with_writer(io::stderr)
                .with_filter(LevelFilter::INFO),
        )
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logging();

    // Since the executable name is always the first argument, we must skip to
    // the second one (which is the first "real" user-specified arg) to get the file name.
    let input_file_path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("No input file path specified"))?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(&input_file_path)?;

    info!("Replaying commands from {input_file_path}");

    let clock = ManualClock::default();
    let mut engine = RentalEngine::new(InMemoryLedger::default(), clock.clone());
    let events = engine.subscribe();
    let mut rejected = 0_usize;
    for row in reader.deserialize() {
        let command: Command = row?;
        // Rejected commands leave the engine untouched; log them and keep going.
        if let Err(err) = replay::apply(&mut engine, &clock, &command) {
            rejected += 1;
            error!(
                "[{}] {:?} at {} rejected: {err}",
                command.caller, command.op, command.at
            );
        }
        for event in events.try_iter() {
            info!("{event:?}");
        }
    }

    if rejected > 0 {
        warn!("{rejected} command(s) rejected");
    }

    {
        let stdout = io::stdout();
        let stdio = stdout.lock();
        let mut writer = csv::Writer::from_writer(stdio);
        for book in engine.books() {
            writer.serialize(&book)?;
        }
        writer.flush()?;
    }

    info!("Reserve after replay: {}", engine.reserve());
    for (address, balance) in engine.payout().balances() {
        info!("[Ledger] {address}: {balance}");
    }

    Ok(())
}
