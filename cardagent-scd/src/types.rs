// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

use std::fmt;
use std::str::FromStr;

use crate::error::ScdError;

/// Digest algorithms the daemon accepts as a `--hash` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgo {
    Md5,
    Rmd160,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgo {
    pub fn name(self) -> &'static str {
        match self {
            DigestAlgo::Md5 => "md5",
            DigestAlgo::Rmd160 => "rmd160",
            DigestAlgo::Sha1 => "sha1",
            DigestAlgo::Sha224 => "sha224",
            DigestAlgo::Sha256 => "sha256",
            DigestAlgo::Sha384 => "sha384",
            DigestAlgo::Sha512 => "sha512",
        }
    }

    /// The `PKSIGN` option selecting this algorithm.
    pub fn option(self) -> String {
        format!("--hash={}", self.name())
    }
}

impl fmt::Display for DigestAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgo {
    type Err = ScdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(DigestAlgo::Md5),
            "rmd160" | "ripemd160" => Ok(DigestAlgo::Rmd160),
            "sha1" => Ok(DigestAlgo::Sha1),
            "sha224" => Ok(DigestAlgo::Sha224),
            "sha256" => Ok(DigestAlgo::Sha256),
            "sha384" => Ok(DigestAlgo::Sha384),
            "sha512" => Ok(DigestAlgo::Sha512),
            other => Err(ScdError::InvalidValue(format!("unknown digest algorithm '{other}'"))),
        }
    }
}

/// One `KEYINFO` record reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardKeyInfo {
    /// 40 hex digit keygrip, as sent
    pub keygrip: String,
    pub serialno: String,
    /// Key reference on the card, e.g. `OPENPGP.1`
    pub idstr: String,
}

/// Receives the records streamed by `LEARN`.
pub trait LearnSink: Send {
    fn keypair_info(&mut self, args: &str);

    fn cert_info(&mut self, args: &str);

    /// Any other status line carrying arguments.
    fn info(&mut self, keyword: &str, args: &str);
}

/// `LEARN` output collected in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LearnResult {
    pub keypairs: Vec<String>,
    pub certs: Vec<String>,
    pub info: Vec<(String, String)>,
}

impl LearnSink for LearnResult {
    fn keypair_info(&mut self, args: &str) {
        self.keypairs.push(args.to_string());
    }

    fn cert_info(&mut self, args: &str) {
        self.certs.push(args.to_string());
    }

    fn info(&mut self, keyword: &str, args: &str) {
        self.info.push((keyword.to_string(), args.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::md5("md5", DigestAlgo::Md5, "--hash=md5")]
    #[case::rmd160("RIPEMD160", DigestAlgo::Rmd160, "--hash=rmd160")]
    #[case::sha1("sha1", DigestAlgo::Sha1, "--hash=sha1")]
    #[case::sha224("sha224", DigestAlgo::Sha224, "--hash=sha224")]
    #[case::sha256("SHA256", DigestAlgo::Sha256, "--hash=sha256")]
    #[case::sha384("sha384", DigestAlgo::Sha384, "--hash=sha384")]
    #[case::sha512("sha512", DigestAlgo::Sha512, "--hash=sha512")]
    fn digest_options(#[case] name: &str, #[case] algo: DigestAlgo, #[case] option: &str) {
        let parsed: DigestAlgo = name.parse().unwrap();
        assert_eq!(parsed, algo);
        assert_eq!(parsed.option(), option);
    }

    #[test]
    fn unknown_digest() {
        assert!(matches!(
            "whirlpool".parse::<DigestAlgo>(),
            Err(ScdError::InvalidValue(_))
        ));
    }
}
