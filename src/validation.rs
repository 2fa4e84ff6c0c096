//! Input checks for values that end up on the wire.

const NICK_SPECIALS: &str = "[]{}\\|_^`";

/// Channel names start with `#` or `&` and carry no spaces, commas or BEL.
pub fn validate_channel_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Channel name cannot be empty".to_string());
    }
    if !name.starts_with('#') && !name.starts_with('&') {
        return Err(format!("Channel name must start with # or &: {}", name));
    }
    if name.len() > 50 {
        return Err("Channel name too long (max 50 characters)".to_string());
    }
    if name.contains(|c: char| c.is_control() || c == ' ' || c == ',') {
        return Err(format!("Channel name contains invalid characters: {:?}", name));
    }
    Ok(())
}

/// Nicknames start with a letter or one of `[]{}\|_^` followed by letters,
/// digits, `-` or specials. Servers differ on the limit; 30 is generous.
pub fn validate_nickname(nick: &str) -> Result<(), String> {
    let first = nick
        .chars()
        .next()
        .ok_or_else(|| "Nickname cannot be empty".to_string())?;
    if nick.len() > 30 {
        return Err("Nickname too long (max 30 characters)".to_string());
    }
    if !first.is_alphabetic() && !NICK_SPECIALS.contains(first) {
        return Err(format!("Nickname must start with a letter: {}", nick));
    }
    if let Some(bad) = nick
        .chars()
        .find(|c| !c.is_alphanumeric() && *c != '-' && !NICK_SPECIALS.contains(*c))
    {
        return Err(format!("Invalid character '{}' in nickname", bad));
    }
    Ok(())
}

/// A bare host name or address, no port and no whitespace.
pub fn validate_host(host: &str) -> Result<(), String> {
    if host.is_empty() {
        return Err("Hostname cannot be empty".to_string());
    }
    if host.contains(|c: char| c.is_whitespace() || c == '/') {
        return Err(format!("Invalid hostname: {}", host));
    }
    Ok(())
}

/// Split `host[:port]` into its parts, defaulting to 6667.
pub fn validate_server_address(addr: &str) -> Result<(String, u16), String> {
    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("Invalid port number: {}", port))?;
            (host, port)
        }
        Some(_) => return Err("Invalid server format. Use 'host:port' or 'host'".to_string()),
        None => (addr, 6667),
    };
    validate_host(host)?;
    if port == 0 {
        return Err("Port number must be greater than 0".to_string());
    }
    Ok((host.to_string(), port))
}

/// Strip CR, LF and NUL so a caller cannot smuggle extra protocol lines.
pub fn sanitize_line(line: &str) -> String {
    line.chars()
        .filter(|&c| c != '\r' && c != '\n' && c != '\0')
        .collect()
}
