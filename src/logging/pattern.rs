//! spdlog-style line templates
//!
//! Supported flags:
//!
//! | flag | output |
//! |------|--------|
//! | `%Y %y %m %d %H %M %S %I %p %b %B %a %A %D %T %z %E` | date and time parts |
//! | `%e` / `%f` / `%F` | milliseconds / microseconds / nanoseconds |
//! | `%c` | full date and time |
//! | `%l` / `%L` | level name / one-letter level |
//! | `%v` | message and fields |
//! | `%n` | logger name |
//! | `%P` / `%t` | process id / thread id |
//! | `%^` ... `%$` | colored range (console only) |
//! | `%%` | a literal `%` |
//!
//! Unknown flags are copied to the output unchanged.

use std::fmt::{self, Write as _};

use chrono::{DateTime, Local};
use colored::{ColoredString, Colorize};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use super::is_critical;

/// Severity as rendered by `%l`, `%L` and the color range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Level(Level),
    Critical,
}

impl Severity {
    fn of(event: &Event<'_>) -> Self {
        let meta = event.metadata();
        if is_critical(meta) {
            Severity::Critical
        } else {
            Severity::Level(*meta.level())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(String),
    /// A chrono format string
    Time(&'static str),
    Level,
    ShortLevel,
    Message,
    Name,
    Pid,
    Thread,
    ColorStart,
    ColorEnd,
}

/// Event formatter driven by a parsed template
#[derive(Debug, Clone)]
pub struct PatternFormat {
    tokens: Vec<Token>,
    name: String,
}

impl PatternFormat {
    pub fn new(pattern: &str, name: impl Into<String>) -> Self {
        Self {
            tokens: parse(pattern),
            name: name.into(),
        }
    }

    /// Render one line (without the newline) and the byte range to color
    fn render(
        &self,
        line: &mut String,
        now: &DateTime<Local>,
        severity: Severity,
        message: impl FnOnce(&mut String) -> fmt::Result,
    ) -> Result<Option<(usize, usize)>, fmt::Error> {
        let mut message = Some(message);
        let mut color_start = None;
        let mut color_range = None;

        for token in &self.tokens {
            match token {
                Token::Literal(text) => line.push_str(text),
                Token::Time(items) => write!(line, "{}", now.format(items))?,
                Token::Level => line.push_str(level_name(severity)),
                Token::ShortLevel => line.push_str(short_level_name(severity)),
                Token::Message => {
                    if let Some(render) = message.take() {
                        render(line)?;
                    }
                }
                Token::Name => line.push_str(&self.name),
                Token::Pid => write!(line, "{}", std::process::id())?,
                Token::Thread => line.push_str(&thread_id()),
                Token::ColorStart => color_start = Some(line.len()),
                Token::ColorEnd => {
                    if let Some(start) = color_start.take() {
                        color_range = Some((start, line.len()));
                    }
                }
            }
        }

        // An unterminated color range runs to the end of the line
        if let Some(start) = color_start {
            color_range = Some((start, line.len()));
        }
        Ok(color_range)
    }
}

impl<S, N> FormatEvent<S, N> for PatternFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let now = Local::now();
        let severity = Severity::of(event);
        let mut line = String::with_capacity(128);

        let color_range = self.render(&mut line, &now, severity, |buf| {
            ctx.field_format().format_fields(Writer::new(buf), event)
        })?;

        match color_range {
            Some((start, end)) if writer.has_ansi_escapes() => {
                let colored = colorize(&line[start..end], severity);
                writeln!(writer, "{}{}{}", &line[..start], colored, &line[end..])
            }
            _ => writeln!(writer, "{line}"),
        }
    }
}

fn parse(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }

        let token = match chars.next() {
            Some(flag) => match flag_token(flag) {
                Some(token) => token,
                None => {
                    literal.push('%');
                    if flag != '%' {
                        literal.push(flag);
                    }
                    continue;
                }
            },
            None => {
                literal.push('%');
                continue;
            }
        };

        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }
        tokens.push(token);
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    tokens
}

fn flag_token(flag: char) -> Option<Token> {
    let token = match flag {
        'Y' => Token::Time("%Y"),
        'y' => Token::Time("%y"),
        'm' => Token::Time("%m"),
        'd' => Token::Time("%d"),
        'H' => Token::Time("%H"),
        'M' => Token::Time("%M"),
        'S' => Token::Time("%S"),
        'I' => Token::Time("%I"),
        'p' => Token::Time("%p"),
        'b' | 'h' => Token::Time("%b"),
        'B' => Token::Time("%B"),
        'a' => Token::Time("%a"),
        'A' => Token::Time("%A"),
        'D' | 'x' => Token::Time("%m/%d/%y"),
        'T' | 'X' => Token::Time("%H:%M:%S"),
        'c' => Token::Time("%a %b %d %H:%M:%S %Y"),
        'z' => Token::Time("%:z"),
        'E' => Token::Time("%s"),
        'e' => Token::Time("%3f"),
        'f' => Token::Time("%6f"),
        'F' => Token::Time("%9f"),
        'l' => Token::Level,
        'L' => Token::ShortLevel,
        'v' => Token::Message,
        'n' => Token::Name,
        'P' => Token::Pid,
        't' => Token::Thread,
        '^' => Token::ColorStart,
        '$' => Token::ColorEnd,
        _ => return None,
    };
    Some(token)
}

fn level_name(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "critical",
        Severity::Level(Level::TRACE) => "trace",
        Severity::Level(Level::DEBUG) => "debug",
        Severity::Level(Level::INFO) => "info",
        Severity::Level(Level::WARN) => "warning",
        Severity::Level(_) => "error",
    }
}

fn short_level_name(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "C",
        Severity::Level(Level::TRACE) => "T",
        Severity::Level(Level::DEBUG) => "D",
        Severity::Level(Level::INFO) => "I",
        Severity::Level(Level::WARN) => "W",
        Severity::Level(_) => "E",
    }
}

fn colorize(text: &str, severity: Severity) -> ColoredString {
    match severity {
        Severity::Critical => text.white().on_red().bold(),
        Severity::Level(Level::TRACE) => text.white(),
        Severity::Level(Level::DEBUG) => text.cyan(),
        Severity::Level(Level::INFO) => text.green(),
        Severity::Level(Level::WARN) => text.yellow().bold(),
        Severity::Level(_) => text.red().bold(),
    }
}

fn thread_id() -> String {
    // ThreadId has no stable accessor; its Debug form is `ThreadId(N)`
    let id = format!("{:?}", std::thread::current().id());
    id.trim_start_matches("ThreadId(")
        .trim_end_matches(')')
        .to_string()
}
