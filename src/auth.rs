use anyhow::{Result, bail};
use std::io::{self, BufRead, IsTerminal};
use zeroize::Zeroizing;

pub const PASSPHRASE_ENV: &str = "SEALPOST_PASSPHRASE";
pub const NEW_PASSPHRASE_ENV: &str = "SEALPOST_NEW_PASSPHRASE";

pub fn read_passphrase() -> Result<Zeroizing<String>> {
    //  Environment Variable
    //  SEALPOST_PASSPHRASE="correct horse" sealpost feed
    if let Some(pw) = from_env(PASSPHRASE_ENV) {
        return Ok(pw);
    }

    //  stdin (Pipeline)
    //  printf "%s\n" "$PASSPHRASE" | sealpost feed
    if !io::stdin().is_terminal() {
        let mut pw = Zeroizing::new(String::new());
        io::stdin().lock().read_line(&mut pw)?;
        trim_newline(&mut pw);

        if !pw.is_empty() {
            return Ok(pw);
        }
    } else {
        let pw = Zeroizing::new(rpassword::prompt_password("Passphrase: ")?);
        if !pw.is_empty() {
            return Ok(pw);
        }
    }

    bail!("No passphrase provided")
}

/// A passphrase being chosen: the first set variable in `envs`, or two
/// matching lines from stdin or the prompt.
pub fn read_new_passphrase(envs: &[&str]) -> Result<Zeroizing<String>> {
    if let Some(pw) = envs.iter().find_map(|name| from_env(name)) {
        return Ok(pw);
    }

    let (pw1, pw2) = if !io::stdin().is_terminal() {
        let stdin = io::stdin();
        let mut handle = stdin.lock();

        let mut pw1 = Zeroizing::new(String::new());
        let mut pw2 = Zeroizing::new(String::new());

        handle.read_line(&mut pw1)?;
        handle.read_line(&mut pw2)?;

        trim_newline(&mut pw1);
        trim_newline(&mut pw2);
        (pw1, pw2)
    } else {
        (
            Zeroizing::new(rpassword::prompt_password("New passphrase: ")?),
            Zeroizing::new(rpassword::prompt_password("Confirm passphrase: ")?),
        )
    };

    if pw1.is_empty() {
        bail!("passphrase cannot be empty");
    }

    if pw1 != pw2 {
        bail!("passphrases do not match");
    }

    Ok(pw1)
}

fn from_env(name: &str) -> Option<Zeroizing<String>> {
    std::env::var(name)
        .ok()
        .filter(|pw| !pw.is_empty())
        .map(Zeroizing::new)
}

fn trim_newline(s: &mut String) {
    while s.ends_with('\n') || s.ends_with('\r') {
        s.pop();
    }
}
