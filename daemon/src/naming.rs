//! Endpoint-name generation. Names come from a config template with two
//! substitutions: `{t}` is a base-52 tag of the current unix seconds and
//! `{i}` is the tail of the peer's IP text.

use flint::time;

/// Name field width on the wire, including the terminator.
pub const ENDPOINT_NAME_LEN: usize = 24;

const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const TIME_BASE: u64 = 52;
const IP_FRAGMENT_LEN: usize = 4;

/// Base-52 tag of a seconds timestamp, least-significant digit first.
pub fn time_tag(seconds: u64) -> String {
    let mut value = seconds;
    let mut tag = String::new();

    loop {
        tag.push(DIGITS[(value % TIME_BASE) as usize] as char);
        value /= TIME_BASE;
        if value == 0 {
            break;
        }
    }

    tag
}

/// The last four characters of the peer's IP text.
pub fn ip_fragment(ip: &str) -> &str {
    let start = ip.len().saturating_sub(IP_FRAGMENT_LEN);
    &ip[start..]
}

/// Expands `{t}`/`{i}` in the pattern. An unterminated brace or an
/// unknown token ends the expansion. The result is capped at
/// `ENDPOINT_NAME_LEN - 1` bytes, leaving room for the terminator.
pub fn expand(pattern: &str, tag: &str, fragment: &str) -> String {
    let mut out = String::new();
    let mut chars = pattern.chars().peekable();

    while out.len() < ENDPOINT_NAME_LEN - 1 {
        let ch = match chars.next() {
            Some(ch) => ch,
            None => break,
        };

        if ch != '{' {
            out.push(ch);
            continue;
        }

        let token = match chars.next() {
            Some(token) => token,
            None => break,
        };
        if chars.next() != Some('}') {
            break;
        }

        let substitution = match token {
            't' => tag,
            'i' => fragment,
            _ => break,
        };

        for sub in substitution.chars() {
            if out.len() >= ENDPOINT_NAME_LEN - 1 {
                break;
            }
            out.push(sub);
        }
    }

    out.truncate(ENDPOINT_NAME_LEN - 1);
    out
}

/// Generates a display name for a clicker at the given peer IP.
pub fn generate(pattern: &str, ip: &str) -> String {
    expand(pattern, &time_tag(time::timestamp_secs()), ip_fragment(ip))
}
