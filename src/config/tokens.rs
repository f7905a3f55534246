//! `~` and `%`-token expansion, mirroring OpenSSH's substitution rules
//! closely enough that a user's existing config behaves the way they expect.

use std::path::{Path, PathBuf};

/// Tokens a given config field is allowed to use. `%%` is always accepted
/// and always means a literal `%`; it is not part of this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// `%h` - resolved alias hostname
    Hostname,
    /// `%n` - the alias as originally typed
    OriginalHost,
    /// `%p` - resolved port
    Port,
    /// `%r` - resolved user
    RemoteUser,
    /// `%d` - local home directory
    LocalHome,
    /// `%i` - local uid
    LocalUid,
    /// `%j` - resolved ProxyJump string
    ProxyJump,
    /// `%k` - host key alias (same as `%h` here; no separate HostKeyAlias support)
    HostKeyAlias,
    /// `%L` - short local hostname (no domain suffix)
    LocalHostShort,
    /// `%l` - full local hostname
    LocalHostFull,
    /// `%u` - local username
    LocalUser,
}

impl Token {
    fn letter(self) -> char {
        match self {
            Token::Hostname => 'h',
            Token::OriginalHost => 'n',
            Token::Port => 'p',
            Token::RemoteUser => 'r',
            Token::LocalHome => 'd',
            Token::LocalUid => 'i',
            Token::ProxyJump => 'j',
            Token::HostKeyAlias => 'k',
            Token::LocalHostShort => 'L',
            Token::LocalHostFull => 'l',
            Token::LocalUser => 'u',
        }
    }
}

pub const HOSTNAME_TOKENS: &[Token] = &[Token::Hostname];
pub const PROXY_JUMP_TOKENS: &[Token] = &[Token::Hostname, Token::OriginalHost, Token::Port, Token::RemoteUser];
pub const IDENTITY_FILE_TOKENS: &[Token] = &[
    Token::LocalHome,
    Token::Hostname,
    Token::LocalUid,
    Token::ProxyJump,
    Token::HostKeyAlias,
    Token::LocalHostShort,
    Token::LocalHostFull,
    Token::OriginalHost,
    Token::Port,
    Token::RemoteUser,
    Token::LocalUser,
];

/// Bound values available for substitution. Not every field populates every
/// binding; a bound value whose token isn't in the field's allowed set is
/// simply never looked up.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    pub hostname: Option<String>,
    pub original_host: Option<String>,
    pub port: Option<u16>,
    pub remote_user: Option<String>,
    pub proxy_jump: Option<String>,
}

fn local_home() -> String {
    dirs::home_dir()
        .map(|h| h.display().to_string())
        .unwrap_or_default()
}

fn local_uid() -> String {
    #[cfg(unix)]
    {
        unsafe { libc_getuid().to_string() }
    }
    #[cfg(not(unix))]
    {
        "0".to_string()
    }
}

#[cfg(unix)]
fn libc_getuid() -> u32 {
    // SAFETY: getuid takes no arguments and cannot fail.
    unsafe extern "C" {
        fn getuid() -> u32;
    }
    unsafe { getuid() }
}

fn local_hostname_full() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn local_hostname_short() -> String {
    local_hostname_full()
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

fn local_user() -> String {
    whoami::username()
}

/// Replace a leading `~` (or `~/...`) with the current user's home
/// directory. Leaves the path untouched if no home directory is known.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

fn resolve(token: Token, bindings: &Bindings) -> Option<String> {
    match token {
        Token::Hostname => bindings.hostname.clone(),
        Token::OriginalHost => bindings.original_host.clone(),
        Token::Port => bindings.port.map(|p| p.to_string()),
        Token::RemoteUser => bindings.remote_user.clone(),
        Token::LocalHome => Some(local_home()),
        Token::LocalUid => Some(local_uid()),
        Token::ProxyJump => bindings.proxy_jump.clone(),
        Token::HostKeyAlias => bindings.hostname.clone(),
        Token::LocalHostShort => Some(local_hostname_short()),
        Token::LocalHostFull => Some(local_hostname_full()),
        Token::LocalUser => Some(local_user()),
    }
}

/// Scan `template` left-to-right, replacing each `%X` where `X` is in
/// `allowed` with its bound value. `%%` always yields a literal `%` and is
/// never re-scanned. Unknown `%X` sequences are left verbatim.
pub fn substitute(template: &str, allowed: &[Token], bindings: &Bindings) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        match chars.peek().copied() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some(letter) => {
                if let Some(token) = allowed.iter().find(|t| t.letter() == letter) {
                    chars.next();
                    if let Some(value) = resolve(*token, bindings) {
                        out.push_str(&value);
                    }
                } else {
                    out.push('%');
                }
            }
            None => out.push('%'),
        }
    }

    out
}

/// `expand-home` followed by `substitute`, for path-shaped fields like
/// `IdentityFile`.
pub fn expand_path_template(template: &str, allowed: &[Token], bindings: &Bindings) -> PathBuf {
    let substituted = substitute(template, allowed, bindings);
    expand_home(&substituted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings() -> Bindings {
        Bindings {
            hostname: Some("10.0.0.5".to_string()),
            original_host: Some("myalias".to_string()),
            port: Some(2222),
            remote_user: Some("alice".to_string()),
            proxy_jump: Some("bastion".to_string()),
        }
    }

    #[test]
    fn hostname_field_only_expands_h() {
        let out = substitute("%h-%n", HOSTNAME_TOKENS, &bindings());
        assert_eq!(out, "10.0.0.5-%n");
    }

    #[test]
    fn proxy_jump_field_expands_its_tokens() {
        let out = substitute("%r@%h:%p", PROXY_JUMP_TOKENS, &bindings());
        assert_eq!(out, "alice@10.0.0.5:2222");
    }

    #[test]
    fn percent_escape_is_not_rescanned() {
        let out = substitute("100%%h", HOSTNAME_TOKENS, &bindings());
        assert_eq!(out, "100%h");
    }

    #[test]
    fn unknown_token_left_verbatim() {
        let out = substitute("%q", HOSTNAME_TOKENS, &bindings());
        assert_eq!(out, "%q");
    }

    #[test]
    fn trailing_percent_left_verbatim() {
        let out = substitute("abc%", HOSTNAME_TOKENS, &bindings());
        assert_eq!(out, "abc%");
    }

    #[test]
    fn expand_home_replaces_leading_tilde() {
        let expanded = expand_home("~/id_ed25519");
        assert!(expanded.is_absolute() || expanded == PathBuf::from("~/id_ed25519"));
    }

    #[test]
    fn identity_file_tokens_include_proxy_jump_and_home() {
        let out = substitute("%d/.ssh/%j", IDENTITY_FILE_TOKENS, &bindings());
        assert!(out.ends_with("/.ssh/bastion"));
    }
}
