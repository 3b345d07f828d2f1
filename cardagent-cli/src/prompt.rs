// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! PIN entry on the controlling terminal.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};

use cardagent_scd::{PinPrompt, Result, ScdError};
use futures::future::BoxFuture;
use nix::sys::termios::{self, LocalFlags, SetArg};
use secrecy::SecretString;
use zeroize::Zeroizing;

/// Reads PINs from `/dev/tty` with echo turned off.
pub struct TtyPrompt;

/// Text shown to the user. The daemon prefixes its prompt with flags
/// enclosed in `|`; those are not displayed.
pub fn prompt_text(desc: Option<&str>, info: &str) -> String {
    let info = match info.strip_prefix('|') {
        Some(rest) => rest.split_once('|').map_or(rest, |(_, text)| text),
        None => info,
    };
    let info = if info.is_empty() { "PIN" } else { info };
    match desc {
        Some(desc) => format!("{desc}\n{info}: "),
        None => format!("{info}: "),
    }
}

fn open_tty() -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).open("/dev/tty")
}

fn read_secret(prompt: &str) -> std::io::Result<SecretString> {
    let mut tty = open_tty()?;
    tty.write_all(prompt.as_bytes())?;
    tty.flush()?;

    let original = termios::tcgetattr(&tty)?;
    let mut silent = original.clone();
    silent.local_flags.remove(LocalFlags::ECHO);
    silent.local_flags.insert(LocalFlags::ECHONL);
    termios::tcsetattr(&tty, SetArg::TCSAFLUSH, &silent)?;

    let mut line = Zeroizing::new(String::new());
    let read = BufReader::new(&tty).read_line(&mut line);
    termios::tcsetattr(&tty, SetArg::TCSAFLUSH, &original)?;
    read?;

    let pin = line.trim_end_matches(['\r', '\n']);
    Ok(SecretString::from(pin.to_owned()))
}

impl PinPrompt for TtyPrompt {
    fn get_pin<'a>(
        &'a self,
        desc: Option<&'a str>,
        info: &'a str,
        _max_len: usize,
    ) -> BoxFuture<'a, Result<SecretString>> {
        let text = prompt_text(desc, info);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || read_secret(&text))
                .await
                .map_err(|e| ScdError::PinEntry(format!("PIN entry task failed: {e}")))?
                .map_err(|e| ScdError::PinEntry(format!("cannot read PIN from terminal: {e}")))
        })
    }

    fn show_pinpad<'a>(&'a self, desc: Option<&'a str>, info: &'a str) -> BoxFuture<'a, Result<()>> {
        let text = prompt_text(desc, info);
        Box::pin(async move {
            eprintln!("{}", text.trim_end_matches([':', ' ']));
            eprintln!("(enter the PIN on the reader's pinpad)");
            Ok(())
        })
    }

    fn dismiss_pinpad(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain(None, "PIN", "PIN: ")]
    #[case::flags(None, "|A|Admin PIN", "Admin PIN: ")]
    #[case::empty_flags(None, "||Please enter the PIN", "Please enter the PIN: ")]
    #[case::only_flags(None, "||", "PIN: ")]
    #[case::with_desc(Some("Signing key"), "||PIN", "Signing key\nPIN: ")]
    fn prompts(#[case] desc: Option<&str>, #[case] info: &str, #[case] expected: &str) {
        assert_eq!(prompt_text(desc, info), expected);
    }
}
