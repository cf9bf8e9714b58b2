pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";

/// HttpOnly, Secure auth cookie scoped to the whole site.
pub fn auth_cookie(name: &str, value: &str, max_age_secs: u64) -> String {
    format!(
        "{}={}; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age={}",
        name, value, max_age_secs
    )
}

/// Immediately-expiring cookie used to clear credentials on logout.
pub fn expired_cookie(name: &str) -> String {
    format!(
        "{}=; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age=0",
        name
    )
}

/// Pull a single cookie value out of a raw `Cookie` request header.
pub fn cookie_value(cookie_header: &str, name: &str) -> Option<String> {
    for cookie in cookie_header.split(';') {
        if let Some((k, v)) = cookie.trim().split_once('=') {
            if k.trim() == name {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}
