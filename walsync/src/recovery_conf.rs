//! Key-scoped rewriting of `postgresql.conf`.
//!
//! The recovery-target keys are updated through a line-oriented parse and
//! re-render, never through textual substitution: comments, quoting and
//! every unrelated line come back byte for byte. The rendered file replaces
//! the original through a sibling temp file and rename.

use postgres_wal::Lsn;

/// Keys this system owns. Everything else in the file is untouchable.
const RECOVERY_TARGET_LSN: &str = "recovery_target_lsn";
const RECOVERY_TARGET_ACTION: &str = "recovery_target_action";
const RECOVERY_TARGET_INCLUSIVE: &str = "recovery_target_inclusive";
const CLEARED_KEYS: &[&str] = &[
    "recovery_target_name",
    "recovery_target_time",
    "recovery_target_xid",
];

/// A parsed `postgresql.conf`, preserving every line as written.
#[derive(Debug)]
pub struct ConfDocument {
    lines: Vec<ConfLine>,
}

#[derive(Debug)]
enum ConfLine {
    /// Comment, blank line, or anything else we don't interpret.
    Verbatim(String),
    /// A `key = value` line. `raw` is the original text, kept so unrelated
    /// settings render back unchanged.
    Setting { key: String, raw: String },
}

impl ConfDocument {
    pub fn parse(text: &str) -> ConfDocument {
        let lines = text
            .lines()
            .map(|line| match setting_key(line) {
                Some(key) => ConfLine::Setting {
                    key,
                    raw: line.to_owned(),
                },
                None => ConfLine::Verbatim(line.to_owned()),
            })
            .collect();
        ConfDocument { lines }
    }

    /// Set `key = 'value'`, replacing the last occurrence (the one Postgres
    /// honors) or appending if the key is absent.
    pub fn set(&mut self, key: &str, value: &str) {
        let rendered = format!("{key} = {}", quote_conf_value(value));
        let last = self
            .lines
            .iter()
            .rposition(|line| matches!(line, ConfLine::Setting { key: k, .. } if k.eq_ignore_ascii_case(key)));
        match last {
            Some(index) => {
                self.lines[index] = ConfLine::Setting {
                    key: key.to_owned(),
                    raw: rendered,
                };
            }
            None => self.lines.push(ConfLine::Setting {
                key: key.to_owned(),
                raw: rendered,
            }),
        }
    }

    /// Remove every occurrence of `key`.
    pub fn clear(&mut self, key: &str) {
        self.lines.retain(
            |line| !matches!(line, ConfLine::Setting { key: k, .. } if k.eq_ignore_ascii_case(key)),
        );
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                ConfLine::Verbatim(raw) | ConfLine::Setting { raw, .. } => {
                    out.push_str(raw);
                    out.push('\n');
                }
            }
        }
        out
    }
}

/// Extract the GUC name from a settings line, or `None` for comments and
/// blanks. Postgres accepts `key = value` and `key value`.
fn setting_key(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let key: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .collect();
    if key.is_empty() {
        return None;
    }
    Some(key)
}

/// Single-quote a value for `postgresql.conf`; embedded quotes double.
fn quote_conf_value(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Rewrite `conf_text` so recovery stops exactly at `lsn` and shuts down.
///
/// Sets the LSN target keys and removes the name/time/xid targets so no
/// stale target from a previous run can win.
pub fn apply_recovery_target(conf_text: &str, lsn: Lsn) -> String {
    let mut document = ConfDocument::parse(conf_text);
    document.set(RECOVERY_TARGET_LSN, &lsn.to_string());
    document.set(RECOVERY_TARGET_ACTION, "shutdown");
    document.set(RECOVERY_TARGET_INCLUSIVE, "true");
    for key in CLEARED_KEYS {
        document.clear(key);
    }
    document.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_CONF: &str = "\
# -----------------------------
# PostgreSQL configuration file
# -----------------------------
listen_addresses = '*'	# what IP address(es) to listen on
port = 6000
max_connections = 750
shared_buffers = '125MB'        # min 128kB

#archive_mode = off
archive_command = 'cp %p /archive/seg0/%f'
";

    #[test]
    fn unrelated_lines_are_byte_preserved() {
        let rewritten = apply_recovery_target(BASE_CONF, "9/EC0000C8".parse().unwrap());
        for line in BASE_CONF.lines() {
            assert!(rewritten.contains(line), "lost line: {line:?}");
        }
        assert!(rewritten.contains("recovery_target_lsn = '9/EC0000C8'"));
        assert!(rewritten.contains("recovery_target_action = 'shutdown'"));
        assert!(rewritten.contains("recovery_target_inclusive = 'true'"));
    }

    #[test]
    fn existing_recovery_keys_are_replaced_in_place() {
        let conf = format!(
            "{BASE_CONF}recovery_target_lsn = '1/0'\nrecovery_target_action = 'pause'\n"
        );
        let rewritten = apply_recovery_target(&conf, "9/EC0000C8".parse().unwrap());
        assert!(!rewritten.contains("'1/0'"));
        assert!(!rewritten.contains("pause"));
        assert_eq!(
            rewritten.matches("recovery_target_lsn").count(),
            1,
            "{rewritten}"
        );
    }

    #[test]
    fn stale_named_targets_are_cleared() {
        let conf = format!(
            "{BASE_CONF}recovery_target_name = 'sync_point_20260101_000000'\n\
             recovery_target_time = '2026-01-01 00:00:00'\n\
             recovery_target_xid = '12345'\n"
        );
        let rewritten = apply_recovery_target(&conf, "9/EC0000C8".parse().unwrap());
        assert!(!rewritten.contains("recovery_target_name"));
        assert!(!rewritten.contains("recovery_target_time"));
        assert!(!rewritten.contains("recovery_target_xid"));
    }

    #[test]
    fn repeated_keys_replace_the_winning_occurrence() {
        let conf = "recovery_target_lsn = '1/0'\nport = 6000\nrecovery_target_lsn = '2/0'\n";
        let mut document = ConfDocument::parse(conf);
        document.set("recovery_target_lsn", "9/EC0000C8");
        let rendered = document.render();
        // The last occurrence (the one Postgres honors) was replaced; the
        // earlier one is left alone, as is everything in between.
        assert_eq!(
            rendered,
            "recovery_target_lsn = '1/0'\nport = 6000\nrecovery_target_lsn = '9/EC0000C8'\n"
        );
    }

    #[test]
    fn commented_keys_are_not_settings() {
        let conf = "#recovery_target_name = 'x'\n";
        let mut document = ConfDocument::parse(conf);
        document.clear("recovery_target_name");
        assert_eq!(document.render(), conf);
    }

    #[test]
    fn values_with_quotes_are_escaped() {
        assert_eq!(quote_conf_value("it's"), "'it''s'");
        let mut document = ConfDocument::parse("");
        document.set("recovery_target_name", "o'clock");
        assert_eq!(document.render(), "recovery_target_name = 'o''clock'\n");
    }

    #[test]
    fn rewriting_is_idempotent() {
        let lsn: Lsn = "9/EC0000C8".parse().unwrap();
        let once = apply_recovery_target(BASE_CONF, lsn);
        let twice = apply_recovery_target(&once, lsn);
        assert_eq!(once, twice);
    }
}
