// src/http.rs
use std::fmt;

/// Request methods the server answers. Everything else is a bad request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    /// Case-insensitive match on the request-line token.
    pub fn from_token(token: &[u8]) -> Option<Self> {
        if token.eq_ignore_ascii_case(b"GET") {
            Some(Method::Get)
        } else if token.eq_ignore_ascii_case(b"POST") {
            Some(Method::Post)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    RequestLine,
    Headers,
    Content,
}

/// Outcome of parsing and resolving a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// More bytes are needed.
    NoRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    FileRequest,
    InternalError,
}

impl HttpCode {
    /// Status code, reason phrase and inline body for error classifications.
    pub fn error_page(&self) -> Option<(u16, &'static str, &'static str)> {
        match self {
            HttpCode::BadRequest => Some((400, ERROR_400_TITLE, ERROR_400_FORM)),
            HttpCode::ForbiddenRequest => Some((403, ERROR_403_TITLE, ERROR_403_FORM)),
            HttpCode::NoResource => Some((404, ERROR_404_TITLE, ERROR_404_FORM)),
            HttpCode::InternalError => Some((500, ERROR_500_TITLE, ERROR_500_FORM)),
            _ => None,
        }
    }
}

pub const OK_200_TITLE: &str = "OK";
pub const ERROR_400_TITLE: &str = "Bad Request";
pub const ERROR_400_FORM: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
pub const ERROR_403_TITLE: &str = "Forbidden";
pub const ERROR_403_FORM: &str = "You do not have permission to get file from this server.\n";
pub const ERROR_404_TITLE: &str = "Not Found";
pub const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
pub const ERROR_500_TITLE: &str = "Internal Error";
pub const ERROR_500_FORM: &str = "There was an unusual problem serving the request file.\n";

/// Body sent in place of a zero-length file.
pub const EMPTY_DOCUMENT: &str = "<html><body></body></html>";

/// Raw reply written to a connection refused for lack of slots.
pub const BUSY_RESPONSE: &[u8] = b"Internal server busy";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_tokens() {
        assert_eq!(Method::from_token(b"GET"), Some(Method::Get));
        assert_eq!(Method::from_token(b"post"), Some(Method::Post));
        assert_eq!(Method::from_token(b"PUT"), None);
        assert_eq!(Method::Post.to_string(), "POST");
    }

    #[test]
    fn test_error_pages() {
        assert_eq!(HttpCode::NoResource.error_page().unwrap().0, 404);
        assert_eq!(HttpCode::ForbiddenRequest.error_page().unwrap().1, "Forbidden");
        assert!(HttpCode::FileRequest.error_page().is_none());
        assert!(HttpCode::NoRequest.error_page().is_none());
    }
}
