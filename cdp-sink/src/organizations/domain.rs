/// Mail providers whose domain says nothing about an employer
const FREE_EMAIL_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "live.com",
    "msn.com",
    "icloud.com",
    "me.com",
    "aol.com",
    "proton.me",
    "protonmail.com",
    "gmx.com",
    "gmx.de",
    "yandex.ru",
    "mail.ru",
    "qq.com",
    "163.com",
    "users.noreply.github.com",
];

/// Reduce a website or domain to its bare host name
///
/// Strips the scheme, `www.`, any path, query or port, and trailing dots.
/// Returns `None` when nothing is left.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let mut host = raw.trim().to_lowercase();

    if let Some(idx) = host.find("://") {
        host = host[idx + 3..].to_string();
    }
    host = host.trim_start_matches("//").to_string();

    if let Some(idx) = host.find(|c| matches!(c, '/' | '?' | '#')) {
        host.truncate(idx);
    }
    if let Some(idx) = host.find('@') {
        host = host[idx + 1..].to_string();
    }
    if let Some(idx) = host.find(':') {
        host.truncate(idx);
    }

    let host = host.strip_prefix("www.").unwrap_or(&host);
    let host = host.trim_end_matches('.');

    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Normalized domain part of an e-mail address
pub fn email_domain(email: &str) -> Option<String> {
    email
        .trim()
        .rsplit_once('@')
        .and_then(|(local, domain)| if local.is_empty() { None } else { normalize_domain(domain) })
}

pub fn is_free_email_domain(domain: &str) -> bool {
    FREE_EMAIL_DOMAINS.contains(&domain)
}
