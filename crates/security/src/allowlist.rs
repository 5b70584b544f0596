//! Allowlist matching — command prefixes and network domains.
//!
//! Command prefixes match on whole words: `git status` covers
//! `git status --short` but not `git statusx`. Domains match the host
//! itself and any subdomain of it.

/// Whether `command` is covered by `prefix` on a word boundary.
pub fn prefix_matches(prefix: &str, command: &str) -> bool {
    let prefix: Vec<&str> = prefix.split_whitespace().collect();
    if prefix.is_empty() {
        return false;
    }
    let mut words = command.split_whitespace();
    prefix.iter().all(|p| words.next() == Some(*p))
}

/// Whether `host` equals `domain` or is a subdomain of it.
pub fn domain_matches(domain: &str, host: &str) -> bool {
    let domain = domain.trim().trim_start_matches("*.").to_ascii_lowercase();
    let host = host.trim().to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    host == domain
        || host
            .strip_suffix(domain.as_str())
            .is_some_and(|rest| rest.ends_with('.'))
}

/// Extract the host from a URL or bare host string.
pub fn host_of(target: &str) -> String {
    let lower = target.trim().to_lowercase();
    let rest = lower.split_once("://").map(|(_, r)| r).unwrap_or(lower.as_str());
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    if let Some(v6) = authority.strip_prefix('[') {
        return v6.split(']').next().unwrap_or(v6).to_string();
    }
    authority.split(':').next().unwrap_or(authority).to_string()
}

/// Check if a host is a private/internal address.
pub fn is_private_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if host == "localhost" || host.ends_with(".localhost") || host == "::1" || host == "0.0.0.0" {
        return true;
    }

    match host.parse::<std::net::Ipv4Addr>() {
        Ok(ip) => ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified(),
        Err(_) => false,
    }
}

/// A reasonable prefix to remember when a human approves `command`.
///
/// Keeps the program name plus a subcommand-looking second word:
/// `git status --short` → `git status`, `ls -la` → `ls`.
pub fn suggest_prefix(command: &str) -> Option<String> {
    let mut words = command.split_whitespace();
    let program = words.next()?;

    let subcommand = words.next().filter(|w| {
        !w.starts_with('-')
            && w
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    });

    Some(match subcommand {
        Some(sub) => format!("{program} {sub}"),
        None => program.to_string(),
    })
}
