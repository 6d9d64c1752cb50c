//! `livemap watch`: print a live stream.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use livemap_daemon::{open_stream, MarkersDelta, StreamResponse, UsersDelta};

use crate::CallerArgs;

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[command(flatten)]
    pub caller: CallerArgs,

    /// Print raw JSON messages, one per line.
    #[arg(long)]
    pub json: bool,

    /// Exit after this many messages.
    #[arg(long)]
    pub limit: Option<usize>,
}

impl WatchArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let stream = open_stream(&home, self.caller.into()).context("failed to open stream")?;

        if self.limit == Some(0) {
            return Ok(());
        }
        for (count, message) in stream.enumerate() {
            let message = message.context("stream ended with an error")?;
            if self.json {
                println!("{}", serde_json::to_string(&message)?);
            } else {
                print_message(&message);
            }
            if self.limit.is_some_and(|limit| count + 1 >= limit) {
                break;
            }
        }
        Ok(())
    }
}

fn print_message(message: &StreamResponse) {
    match message {
        StreamResponse::Jobs { markers, users } => {
            println!(
                "{} markers: [{}] users: [{}]",
                "jobs".cyan().bold(),
                markers.join(", "),
                users.join(", ")
            );
        }
        StreamResponse::Markers(delta) => print_markers(delta),
        StreamResponse::Users(delta) => print_users(delta),
    }
}

fn print_markers(delta: &MarkersDelta) {
    println!(
        "{} part={} partial={} {} {}",
        "markers".magenta().bold(),
        delta.part,
        delta.partial,
        format!("+{}", delta.updated.len()).green(),
        format!("-{}", delta.deleted.len()).red()
    );
    for marker in &delta.updated {
        println!(
            "  {} #{} [{}] {} ({:.1}, {:.1}) {}",
            "+".green(),
            marker.id,
            marker.job,
            marker.name,
            marker.x,
            marker.y,
            marker.data.kind()
        );
    }
    for id in &delta.deleted {
        println!("  {} #{}", "-".red(), id);
    }
}

fn print_users(delta: &UsersDelta) {
    let duty = if delta.on_duty {
        "on duty".green()
    } else {
        "off duty".bright_black()
    };
    println!(
        "{} part={} partial={} {} {} {}",
        "users".yellow().bold(),
        delta.part,
        delta.partial,
        duty,
        format!("+{}", delta.updated.len()).green(),
        format!("-{}", delta.deleted.len()).red()
    );
    if delta.clear {
        println!("  {}", "cleared".bright_black());
    }
    for user in &delta.updated {
        let postal = user.postal.as_deref().unwrap_or("-");
        println!(
            "  {} {} {} [{} {}] ({:.1}, {:.1}) postal {}",
            "+".green(),
            user.user_id,
            user.name,
            user.job,
            user.job_grade,
            user.x,
            user.y,
            postal
        );
    }
    for id in &delta.deleted {
        println!("  {} {}", "-".red(), id);
    }
}
