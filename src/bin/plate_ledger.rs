//! plate_ledger - inspect the local plate ledger
//!
//! Read-only views over the ledger written by plate_inspectd:
//! - `show --lot ID`: current record per plate in one lot
//! - `today`: every lot recorded on a date, with totals
//! - `week`: Monday-to-Sunday totals per date and lot
//! - `verify`: recompute the row hash chain
//! - `next-lot`: lot id and plate number the next start would use

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDate, TimeZone};
use clap::{Parser, Subcommand};

use plate_inspector::{
    current_rows, weekly_summary, LedgerRow, LedgerStore, Lot, SqliteLedgerStore,
};

#[derive(Parser, Debug)]
#[command(name = "plate_ledger", version, about = "Inspect the local plate ledger")]
struct Args {
    /// Path to the ledger SQLite DB
    #[arg(long, env = "PLATE_DB_PATH", default_value = "plate_ledger.db")]
    db: String,

    /// Print rows as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Current record per plate in a lot
    Show {
        #[arg(long)]
        lot: String,
        /// Include superseded rows
        #[arg(long)]
        all: bool,
    },
    /// Records on a date (default: today)
    Today {
        #[arg(long, value_name = "YYYY-MM-DD")]
        date: Option<NaiveDate>,
    },
    /// Weekly totals per date and lot (week containing the date, default: today)
    Week {
        #[arg(long, value_name = "YYYY-MM-DD")]
        date: Option<NaiveDate>,
    },
    /// Verify the ledger hash chain
    Verify,
    /// Lot id and first plate number the next lot would get
    NextLot {
        #[arg(long, value_name = "YYYY-MM-DD")]
        date: Option<NaiveDate>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let store = SqliteLedgerStore::open(&args.db)?;

    match args.command {
        Command::Show { lot, all } => {
            let rows = store.rows_for_lot(&lot)?;
            if rows.is_empty() {
                return Err(anyhow!("no rows for lot {}", lot));
            }
            let rows = if all { rows } else { current_rows(&rows) };
            print_rows(&rows, args.json)?;
        }
        Command::Today { date } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let rows = current_rows(&store.rows_on(date)?);
            print_rows(&rows, args.json)?;
            if !args.json {
                let defective = rows.iter().filter(|r| !r.defects.is_empty()).count();
                println!(
                    "{}: {} plates, {} passed, {} defective",
                    date,
                    rows.len(),
                    rows.len() - defective,
                    defective
                );
            }
        }
        Command::Week { date } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let week = weekly_summary(&store, date)?;
            if args.json {
                println!("{}", serde_json::to_string(&week)?);
            } else {
                println!("week {} .. {}", week.start, week.end);
                for lot in &week.lots {
                    println!(
                        "{}  {}  {:>5}  {:>5}  {:>5}  {}",
                        lot.date,
                        lot.lot_id,
                        lot.total,
                        lot.passed,
                        lot.defective,
                        lot.most_common_defect.map_or("-", |d| d.as_str())
                    );
                }
                println!(
                    "total: {} plates, {} passed, {} defective",
                    week.total, week.passed, week.defective
                );
            }
        }
        Command::Verify => {
            let checked = store.verify_chain()?;
            println!("OK: ledger chain verified ({} rows)", checked);
        }
        Command::NextLot { date } => {
            let now = match date {
                Some(date) => date
                    .and_hms_opt(12, 0, 0)
                    .and_then(|dt| Local.from_local_datetime(&dt).earliest())
                    .ok_or_else(|| anyhow!("invalid local date {}", date))?,
                None => Local::now(),
            };
            let lot = Lot::start(&store, now)?;
            println!("{} (next plate #{})", lot.lot_id(), lot.next_sequence_no());
        }
    }
    Ok(())
}

fn print_rows(rows: &[LedgerRow], json: bool) -> Result<()> {
    for row in rows {
        if json {
            println!("{}", serde_json::to_string(row)?);
        } else {
            println!(
                "{}  {}  {:>4}  {}  {:<9}  {}  {}",
                row.date,
                row.time.format("%H:%M:%S"),
                row.sequence_no,
                row.lot_id,
                row.shape.as_str(),
                row.defects_text(),
                row.note
            );
        }
    }
    Ok(())
}
