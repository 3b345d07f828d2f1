// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Validation of canonical S-expressions as returned by `READKEY`.

/// Length of the canonical S-expression at the start of `buf`.
///
/// Returns `None` when `buf` does not begin with a complete, well formed
/// expression: balanced lists made of `<decimal-length>:<bytes>` atoms,
/// optionally preceded by a `[<length>:<display-hint>]`.
pub fn canon_len(buf: &[u8]) -> Option<usize> {
    if buf.first() != Some(&b'(') {
        return None;
    }

    let mut pos = 0;
    let mut depth = 0usize;
    let mut in_hint = false;
    while pos < buf.len() {
        match buf[pos] {
            b'(' if !in_hint => {
                depth += 1;
                pos += 1;
            }
            b')' if !in_hint => {
                depth = depth.checked_sub(1)?;
                pos += 1;
                if depth == 0 {
                    return Some(pos);
                }
            }
            b'[' if !in_hint => {
                in_hint = true;
                pos += 1;
            }
            b']' if in_hint => {
                in_hint = false;
                pos += 1;
            }
            b'1'..=b'9' => {
                let start = pos;
                while pos < buf.len() && buf[pos].is_ascii_digit() {
                    pos += 1;
                }
                if buf.get(pos) != Some(&b':') {
                    return None;
                }
                let len: usize = std::str::from_utf8(&buf[start..pos]).ok()?.parse().ok()?;
                pos = pos.checked_add(1 + len)?;
                if pos > buf.len() {
                    return None;
                }
            }
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple(b"(3:foo)", Some(7))]
    #[case::nested(b"(10:public-key(3:rsa(1:n3:\x01\x02\x03)(1:e1:\x03)))", Some(40))]
    #[case::hint(b"([4:text]3:abc)", Some(15))]
    #[case::trailing(b"(1:a)junk", Some(5))]
    #[case::empty(b"", None)]
    #[case::not_a_list(b"3:foo", None)]
    #[case::unbalanced(b"(3:foo", None)]
    #[case::short_atom(b"(9:foo)", None)]
    #[case::leading_zero(b"(03:foo)", None)]
    #[case::missing_colon(b"(3foo)", None)]
    #[case::stray_close(b")", None)]
    fn canonical_lengths(#[case] input: &[u8], #[case] expected: Option<usize>) {
        assert_eq!(canon_len(input), expected);
    }
}
