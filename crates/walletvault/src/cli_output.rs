//! Human-facing terminal I/O for the CLI: notices on stderr, secret input, JSON on stdout.

use eyre::Context as _;
use secrecy::SecretString;
use serde::Serialize;
use std::io::{BufRead as _, IsTerminal as _, Write as _};
use zeroize::Zeroizing;

pub const PASSWORD_ENV: &str = "WALLETVAULT_PASSWORD";

fn stderr_write(s: &str) {
    let mut stderr = std::io::stderr().lock();
    if stderr.write_all(s.as_bytes()).is_err() {
        return;
    }
    let _flush = stderr.flush();
}

fn stderr_writeln(s: &str) {
    stderr_write(&format!("{s}\n"));
}

/// Pretty JSON on stdout; the only thing commands print there.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> eyre::Result<()> {
    let s = serde_json::to_string_pretty(value).context("serialize output")?;
    writeln!(std::io::stdout().lock(), "{s}").context("write stdout")?;
    Ok(())
}

pub fn print_notice(msg: &str) {
    if std::io::stderr().is_terminal() {
        stderr_writeln(msg);
    }
}

pub fn print_generated_warning() {
    stderr_writeln(
        "walletvault: this is the only time the mnemonic and private key are shown. \
         Write the mnemonic down and keep it offline.",
    );
}

/// Read one secret.
///
/// Piped stdin supplies one line per secret, in prompt order; a terminal gets a
/// no-echo prompt on stderr.
pub fn read_secret(prompt: &str) -> eyre::Result<SecretString> {
    if std::io::stdin().is_terminal() {
        let s = rpassword::prompt_password(prompt).context("read secret from terminal")?;
        return Ok(SecretString::new(s.into()));
    }
    let mut line = Zeroizing::new(String::new());
    let n = std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read secret from stdin")?;
    if n == 0 {
        eyre::bail!("stdin closed while waiting for: {}", prompt.trim_end_matches([':', ' ']));
    }
    Ok(SecretString::new(
        line.trim_end_matches(['\r', '\n']).into(),
    ))
}

/// The vault password from `WALLETVAULT_PASSWORD`, else prompted.
pub fn read_password(prompt: &str) -> eyre::Result<SecretString> {
    if let Ok(pw) = std::env::var(PASSWORD_ENV) {
        return Ok(SecretString::new(pw.into()));
    }
    read_secret(prompt)
}

/// A new password entered twice. `WALLETVAULT_PASSWORD` is not consulted.
pub fn read_new_password() -> eyre::Result<SecretString> {
    use secrecy::ExposeSecret as _;
    let first = read_secret("New vault password: ")?;
    if std::io::stdin().is_terminal() {
        let again = read_secret("Repeat password: ")?;
        if again.expose_secret() != first.expose_secret() {
            eyre::bail!("passwords do not match");
        }
    }
    Ok(first)
}

/// Ask on stderr before a destructive step; non-interactive runs need `--yes`.
pub fn confirm_or_bail(question: &str, yes: bool) -> eyre::Result<()> {
    if yes {
        return Ok(());
    }
    let interactive = std::io::stdin().is_terminal() && std::io::stderr().is_terminal();
    if !interactive {
        eyre::bail!("refusing to {question} non-interactively; pass --yes");
    }
    stderr_write(&format!("{question}? [y/N] "));
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read confirmation")?;
    let ans = line.trim().to_ascii_lowercase();
    if ans == "y" || ans == "yes" {
        Ok(())
    } else {
        eyre::bail!("cancelled")
    }
}
