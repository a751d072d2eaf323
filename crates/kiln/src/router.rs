// src/router.rs
use std::collections::HashMap;

pub const REGISTER_OK: &str = "/log.html";
pub const REGISTER_FAILED: &str = "/registerError.html";
pub const LOGIN_OK: &str = "/welcome.html";
pub const LOGIN_FAILED: &str = "/logError.html";

/// Form action encoded in the target of a POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Login,
    Register,
}

/// Where a request target leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<'a> {
    /// Fixed page chosen by the selector character.
    Page(&'a str),
    /// Credential form submission.
    Action(Action),
    /// Serve the target path itself.
    Static,
}

/// Lookup from the character following the last `/` of a target to a
/// fixed landing page.
#[derive(Debug, Clone)]
pub struct RouteTable {
    pages: HashMap<u8, String>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
            .page(b'0', "/register.html")
            .page(b'1', "/log.html")
            .page(b'5', "/picture.html")
            .page(b'6', "/video.html")
            .page(b'7', "/fans.html")
    }
}

impl RouteTable {
    /// An empty table: every target is served as-is.
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
        }
    }

    pub fn page(mut self, selector: u8, path: impl Into<String>) -> Self {
        self.pages.insert(selector, path.into());
        self
    }

    /// `form` is set for POST requests; only those can carry an action.
    pub fn resolve(&self, url: &str, form: bool) -> Route<'_> {
        let selector = url
            .rfind('/')
            .and_then(|slash| url.as_bytes().get(slash + 1).copied());
        let Some(selector) = selector else {
            return Route::Static;
        };

        match selector {
            b'2' if form => Route::Action(Action::Login),
            b'3' if form => Route::Action(Action::Register),
            _ => match self.pages.get(&selector) {
                Some(page) => Route::Page(page.as_str()),
                None => Route::Static,
            },
        }
    }
}

/// Pull `(user, password)` out of a `user=..&passwd=..` form body.
/// Field names are ignored; the first two values are taken in order.
pub fn parse_credentials(body: &[u8]) -> Option<(String, String)> {
    let fields: Vec<(String, String)> = serde_urlencoded::from_bytes(body).ok()?;
    let mut values = fields.into_iter().map(|(_, v)| v);
    let user = values.next()?;
    let password = values.next()?;
    if user.is_empty() {
        return None;
    }
    Some((user, password))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_landing_pages() {
        let routes = RouteTable::default();
        assert_eq!(routes.resolve("/0", false), Route::Page("/register.html"));
        assert_eq!(routes.resolve("/1", true), Route::Page("/log.html"));
        assert_eq!(routes.resolve("/a/5", false), Route::Page("/picture.html"));
        assert_eq!(routes.resolve("/7", false), Route::Page("/fans.html"));
        assert_eq!(routes.resolve("/judge.html", false), Route::Static);
        assert_eq!(routes.resolve("/", false), Route::Static);
    }

    #[test]
    fn test_actions_need_a_form() {
        let routes = RouteTable::default();
        assert_eq!(routes.resolve("/2CGISQL.cgi", true), Route::Action(Action::Login));
        assert_eq!(routes.resolve("/3CGISQL.cgi", true), Route::Action(Action::Register));
        assert_eq!(routes.resolve("/3CGISQL.cgi", false), Route::Static);
    }

    #[test]
    fn test_custom_table() {
        let routes = RouteTable::new().page(b'9', "/about.html");
        assert_eq!(routes.resolve("/9", false), Route::Page("/about.html"));
        assert_eq!(routes.resolve("/0", false), Route::Static);
    }

    #[test]
    fn test_parse_credentials() {
        assert_eq!(
            parse_credentials(b"user=alice&passwd=secret"),
            Some(("alice".to_string(), "secret".to_string()))
        );
        assert_eq!(
            parse_credentials(b"user=a%20b&passwd=p%26q"),
            Some(("a b".to_string(), "p&q".to_string()))
        );
        assert_eq!(parse_credentials(b"user=alice"), None);
        assert_eq!(parse_credentials(b"user=&passwd=x"), None);
    }
}
