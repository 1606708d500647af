//! Plain-text feed renderer.
//!
//! One line per feed item, newest last. This is deliberately not a TUI: the
//! supervisor stays usable over plain pipes, and a richer renderer can sit
//! on the same facade surface.

use athena_feed::facade::FeedItem;
use athena_protocol::feed::FeedKind;
use athena_protocol::feed::FeedLevel;
use chrono::TimeZone;
use chrono::Utc;

const ANSI_RESET: &str = "\x1b[0m";
const ANSI_DIM: &str = "\x1b[2m";
const ANSI_RED: &str = "\x1b[31m";
const ANSI_GREEN: &str = "\x1b[32m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_CYAN: &str = "\x1b[36m";

#[derive(Debug)]
pub struct FeedPrinter {
    color: bool,
    last_seq: Option<u64>,
}

impl FeedPrinter {
    /// Color is on unless `NO_COLOR` is set.
    pub fn new() -> Self {
        Self::with_color(std::env::var_os("NO_COLOR").is_none())
    }

    pub fn with_color(color: bool) -> Self {
        Self {
            color,
            last_seq: None,
        }
    }

    /// Render items not yet printed, in seq order.
    pub fn render_new(&mut self, items: &[FeedItem]) -> Vec<String> {
        let mut lines = Vec::new();
        for item in items {
            if self.last_seq.is_some_and(|seen| item.seq() <= seen) {
                continue;
            }
            self.last_seq = Some(item.seq());
            lines.push(self.render_item(item));
        }
        lines
    }

    pub fn print_new(&mut self, items: &[FeedItem]) {
        for line in self.render_new(items) {
            println!("{line}");
        }
    }

    fn render_item(&self, item: &FeedItem) -> String {
        match item {
            FeedItem::Message(message) => {
                let ts = format_clock(message.ts_ms);
                let body = format!("{ts} {:>10} | {}", message.author, message.text);
                self.paint(ANSI_CYAN, &body)
            }
            FeedItem::Event(event) => {
                let ts = format_clock(event.ts_ms);
                let line = format!(
                    "{ts} {:>10} | {} {}",
                    short_actor(&event.actor_id),
                    event.kind().as_str(),
                    event.title
                );
                match event.level {
                    FeedLevel::Error => self.paint(ANSI_RED, &line),
                    FeedLevel::Debug => self.paint(ANSI_DIM, &line),
                    FeedLevel::Info => match event.kind() {
                        FeedKind::PermissionDecision | FeedKind::StopDecision => {
                            self.paint(ANSI_GREEN, &line)
                        }
                        FeedKind::PermissionRequest | FeedKind::StopRequest => {
                            self.paint(ANSI_YELLOW, &line)
                        }
                        _ => line,
                    },
                }
            }
        }
    }

    fn paint(&self, ansi: &str, text: &str) -> String {
        if self.color {
            format!("{ansi}{text}{ANSI_RESET}")
        } else {
            text.to_string()
        }
    }
}

impl Default for FeedPrinter {
    fn default() -> Self {
        Self::new()
    }
}

fn format_clock(ts_ms: i64) -> String {
    match Utc.timestamp_millis_opt(ts_ms) {
        chrono::LocalResult::Single(ts) => ts.format("%H:%M:%S").to_string(),
        _ => "--:--:--".to_string(),
    }
}

fn short_actor(actor_id: &str) -> &str {
    actor_id
        .split_once(':')
        .map_or(actor_id, |(_, rest)| rest)
}
