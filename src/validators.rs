//! Input validation and sanitization functions for knfw
//!
//! Everything that ends up inside an nftables batch (set names, interface
//! patterns, rule comments) passes through here first.

/// Maximum length of a policy-level set name.
pub const MAX_SET_NAME_LEN: usize = 32;

/// Linux IFNAMSIZ - 1
pub const MAX_INTERFACE_LEN: usize = 15;

/// Sanitizes a label for safe use in nftables comments.
///
/// Removes control characters, quotes, and shell metacharacters.
/// Limits length to 64 bytes (ASCII characters only).
///
/// # Examples
///
/// ```
/// use knfw::validators::sanitize_label;
///
/// let safe = sanitize_label("allow kubelet");
/// assert_eq!(safe, "allow kubelet");
///
/// let safe = sanitize_label("api\n\"server\"");
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_label(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':' | '/' | '@'))
        .take(64)
        .collect()
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Parses `"6443"` or `"30000-32767"` into a validated range.
///
/// # Errors
///
/// Returns `Err` if the text is not a number or `A-B` range, or the range is invalid.
pub fn parse_port_spec(text: &str) -> Result<(u16, u16), String> {
    let text = text.trim();
    let (start, end) = match text.split_once('-') {
        Some((a, b)) => (a.trim(), b.trim()),
        None => (text, text),
    };
    let start: u16 = start
        .parse()
        .map_err(|_| format!("'{text}' is not a port or port range"))?;
    let end: u16 = end
        .parse()
        .map_err(|_| format!("'{text}' is not a port or port range"))?;
    validate_port_range(start, end)
}

/// Validates an interface pattern.
///
/// Linux kernel interface name rules apply (max 15 characters, ASCII
/// alphanumeric plus dot, dash, underscore). A single trailing `*` turns the
/// pattern into a prefix wildcard, as nftables does for `iifname "veth*"`.
///
/// # Errors
///
/// Returns `Err` if the pattern is empty, a bare `*`, too long, or contains
/// invalid characters.
pub fn validate_interface_pattern(pattern: &str) -> Result<String, String> {
    if pattern.is_empty() {
        return Err("Interface pattern cannot be empty".to_string());
    }

    let stem = pattern.strip_suffix('*').unwrap_or(pattern);

    if stem.is_empty() {
        return Err("Interface pattern '*' would match every interface".to_string());
    }

    if stem.len() > MAX_INTERFACE_LEN {
        return Err(format!(
            "Interface name too long (max {MAX_INTERFACE_LEN} characters)"
        ));
    }

    if stem == "." || stem == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(format!(
            "Interface pattern '{pattern}' contains invalid characters"
        ));
    }

    Ok(pattern.to_string())
}

/// Validates a policy set name.
///
/// Lowercase ASCII letters, digits, `_` and `-`; must start with a letter.
///
/// # Errors
///
/// Returns `Err` describing the first violated constraint.
pub fn validate_set_name(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Set name cannot be empty".to_string());
    }

    if name.len() > MAX_SET_NAME_LEN {
        return Err(format!("Set name too long (max {MAX_SET_NAME_LEN} chars)"));
    }

    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err("Set name must start with a lowercase letter".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err("Set name contains invalid characters (use only a-z, 0-9, _, -)".to_string());
    }

    Ok(name.to_string())
}

/// Maps a policy set name onto an nftables identifier (`-` is not allowed there).
pub fn nft_identifier(name: &str) -> String {
    name.replace('-', "_")
}
