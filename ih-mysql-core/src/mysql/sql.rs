//! SQL literal escaping and the shell scripts that carry SQL, backups and
//! restores to a MySQL host
//!
//! Every script is wrapped in `bash -c '...'` because SSM runs commands with
//! `/bin/sh`, which has no `pipefail`. Payloads that could contain secrets
//! travel base64-encoded and land in `umask 0177` temporary files, so they
//! never show up on a command line or in the process list.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::MYSQL_DATA_DIR;

/// Escape a value for use inside a single- or double-quoted SQL literal
///
/// Matches the MySQL client library escaping: NUL, backslash, newline,
/// carriage return, Ctrl-Z and both quote characters get a backslash escape.
pub fn escape_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '\0' => escaped.push_str("\\0"),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\x1a' => escaped.push_str("\\Z"),
            '\'' => escaped.push_str("\\'"),
            '"' => escaped.push_str("\\\""),
            other => escaped.push(other),
        }
    }
    escaped
}

static OBJECT_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/:+=-]*$").expect("valid regex"));

/// Quote `value` as one shell word
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote `script` as the single argument of `bash -c`
pub fn bash_c(script: &str) -> String {
    format!("bash -c {}", shell_quote(script))
}

/// Whether `key` is an object key made only of characters backup keys use
pub fn is_plain_object_key(key: &str) -> bool {
    OBJECT_KEY.is_match(key) && !key.split('/').any(|segment| segment == "..")
}

/// Run `sql` through `mysql -u root`, preserving the client's exit code
pub fn mysql_script(sql: &str) -> String {
    let encoded = BASE64.encode(sql.as_bytes());
    bash_c(&format!(
        "tmpfile=$(umask 0177 && mktemp) && echo {} | base64 -d > \"$tmpfile\" \
         && sudo mysql -u root < \"$tmpfile\"; ret=$?; rm -f \"$tmpfile\"; exit \"$ret\"",
        encoded
    ))
}

/// Stream an xtrabackup through gzip to `s3_uri`
///
/// The backup password is written to a private `.cnf` file that is removed
/// whatever the pipeline's outcome.
pub fn backup_script(backup_password: &str, s3_uri: &str) -> String {
    let cnf = format!(
        "[xtrabackup]\nuser=backup\npassword={}\n",
        backup_password
    );
    let encoded = BASE64.encode(cnf.as_bytes());
    bash_c(&format!(
        "set -o pipefail; \
         cnf=$(umask 0177 && mktemp --suffix=.cnf) && echo {} | base64 -d > \"$cnf\" && \
         sudo xtrabackup --defaults-extra-file=\"$cnf\" --backup --stream=xbstream \
         | gzip | aws s3 cp - {}; \
         ret=$?; rm -f \"$cnf\"; exit \"$ret\"",
        encoded,
        shell_quote(s3_uri)
    ))
}

/// Replace the data directory with the backup at `s3_uri` and restart MySQL
pub fn restore_script(s3_uri: &str) -> String {
    bash_c(&format!(
        "set -o pipefail && \
         sudo systemctl stop mysql && \
         sudo rm -rf {dir}/* && \
         aws s3 cp {uri} - | gunzip | sudo xbstream -x -C {dir} && \
         sudo xtrabackup --prepare --target-dir={dir} && \
         sudo chown -R mysql:mysql {dir} && \
         sudo systemctl start mysql",
        dir = MYSQL_DATA_DIR,
        uri = shell_quote(s3_uri)
    ))
}
