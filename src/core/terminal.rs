//! Operator-facing console output. Plain `[tag] message` lines so the output
//! stays readable when piped into a log collector.

use console::{Style, style};

use crate::core::checkpoint::{FailedJob, Watermark};
use crate::core::timing::MILLIS_PER_SEC;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Ok,
    Note,
    Warn,
    Fail,
}

impl Tone {
    fn tag(self) -> &'static str {
        match self {
            Tone::Ok => "ok",
            Tone::Note => "--",
            Tone::Warn => "!!",
            Tone::Fail => "xx",
        }
    }

    fn style(self) -> Style {
        match self {
            Tone::Ok => Style::new().green(),
            Tone::Note => Style::new().dim(),
            Tone::Warn => Style::new().yellow(),
            Tone::Fail => Style::new().red().bold(),
        }
    }
}

pub fn say(tone: Tone, msg: &str) {
    let line = tone.style().apply_to(format!("[{}] {}", tone.tag(), msg));
    if tone == Tone::Fail {
        eprintln!("{}", line);
    } else {
        println!("{}", line);
    }
}

pub fn print_error(msg: &str) {
    say(Tone::Fail, msg);
}

pub fn heading(text: &str) {
    println!("\n{}", style(text).bold());
}

/// An aligned `label  value` row under a heading.
pub fn field(label: &str, value: &str) {
    println!("  {:<12} {}", style(label).cyan(), value);
}

pub fn print_banner() {
    println!(
        "{} {}",
        style("chat-oracle").bold().cyan(),
        style(concat!("v", env!("CARGO_PKG_VERSION"))).dim()
    );
    println!(
        "{}",
        style("Relays on-chain chat requests to an AI backend and back.").dim()
    );
}

pub fn print_goodbye() {
    say(Tone::Note, "Oracle stopped. Progress is checkpointed.");
}

pub fn describe_watermark(watermark: Option<&Watermark>) -> String {
    match watermark {
        None => "none yet (next start scans the lookback window)".to_string(),
        Some(w) => match w.last_processed_position {
            Some(p) => format!(
                "block {} up to tx {} log {}",
                w.last_processed_block, p.transaction_index, p.log_index
            ),
            None => format!("block {} (complete)", w.last_processed_block),
        },
    }
}

/// One queue entry, with how long until its next attempt.
pub fn describe_job(job: &FailedJob, now_ms: u64) -> String {
    let when = if job.is_due(now_ms) {
        "due now".to_string()
    } else {
        let wait = job.next_attempt_at.saturating_sub(now_ms).div_ceil(MILLIS_PER_SEC);
        format!("in {}s", wait)
    };
    format!(
        "{} at block {} (tx {}), {} failed attempt(s), {}",
        job.event_name, job.block_number, job.transaction_hash, job.retry_count, when
    )
}
