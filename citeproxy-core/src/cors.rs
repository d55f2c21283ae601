//! Header rewriting for cross-origin access, plus the canned responses the proxy sends itself.

use std::net::SocketAddr;

use crate::message::Message;

/// Headers added to every synthesized preflight response.
pub const PREFLIGHT_HEADERS: [(&str, &str); 4] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "GET,POST,OPTIONS,PUT,PATCH,DELETE"),
    ("Access-Control-Allow-Headers", "*"),
    ("Access-Control-Allow-Credentials", "true"),
];

/// Sent to a client when the citation server cannot be reached.
pub const SERVICE_UNAVAILABLE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nContent-Type: text/plain\r\n\r\nZotero is not running.";

const PREFLIGHT_STATUS_LINE: &str = "HTTP/1.1 200 OK";

fn has_value(msg: &Message, name: &str) -> bool {
    msg.headers().get(name).is_some_and(|v| !v.is_empty())
}

/// `OPTIONS` carrying both `Origin` and `Access-Control-Request-Method`.
pub fn is_preflight(msg: &Message) -> bool {
    msg.head.method() == Some("OPTIONS")
        && has_value(msg, "Origin")
        && has_value(msg, "Access-Control-Request-Method")
}

/// 200 response echoing the request's headers with the fixed CORS grants applied.
pub fn preflight_response(request: &Message) -> Vec<u8> {
    let mut response = request.clone();
    response.head.start_line = PREFLIGHT_STATUS_LINE.to_string();
    for (name, value) in PREFLIGHT_HEADERS {
        response.headers_mut().set(name, value);
    }
    response.to_bytes()
}

/// Client -> upstream: point `Host` at the citation server and never keep the upstream alive.
pub fn rewrite_request(msg: &mut Message, upstream: SocketAddr) {
    let headers = msg.headers_mut();
    headers.set("Host", upstream.to_string());
    headers.set("Connection", "close");
}

/// Upstream -> client: allow any origin to read the response.
pub fn rewrite_response(msg: &mut Message) {
    msg.headers_mut().set("Access-Control-Allow-Origin", "*");
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFLIGHT: &[u8] = b"OPTIONS /connector/document/execCommand HTTP/1.1\r\nHost: 127.0.0.1:21931\r\nOrigin: https://addin.example\r\nAccess-Control-Request-Method: POST\r\n\r\n";

    #[test]
    fn detects_preflight() {
        let msg = Message::parse(PREFLIGHT).unwrap();
        assert!(is_preflight(&msg));
    }

    #[test]
    fn plain_options_is_not_preflight() {
        let msg = Message::parse(b"OPTIONS / HTTP/1.1\r\nOrigin: x\r\n\r\n").unwrap();
        assert!(!is_preflight(&msg));
        let msg = Message::parse(
            b"OPTIONS / HTTP/1.1\r\nOrigin: \r\nAccess-Control-Request-Method: GET\r\n\r\n",
        )
        .unwrap();
        assert!(!is_preflight(&msg));
        let msg = Message::parse(
            b"POST / HTTP/1.1\r\nOrigin: x\r\nAccess-Control-Request-Method: GET\r\n\r\n",
        )
        .unwrap();
        assert!(!is_preflight(&msg));
    }

    #[test]
    fn preflight_response_echoes_and_grants() {
        let msg = Message::parse(PREFLIGHT).unwrap();
        let response = Message::parse(&preflight_response(&msg)).unwrap();
        assert_eq!(response.head.start_line, "HTTP/1.1 200 OK");
        assert_eq!(response.headers().get("origin"), Some("https://addin.example"));
        for (name, value) in PREFLIGHT_HEADERS {
            assert_eq!(response.headers().get(name), Some(value));
        }
        assert_eq!(response.headers().len(), 7);
    }

    #[test]
    fn request_rewrite_sets_host_and_connection() {
        let mut msg = Message::parse(
            b"POST /connector/ping HTTP/1.1\r\nhost: localhost:21931\r\nConnection: keep-alive\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap();
        rewrite_request(&mut msg, SocketAddr::from(([127, 0, 0, 1], 23119)));
        assert_eq!(
            msg.to_bytes(),
            b"POST /connector/ping HTTP/1.1\r\nhost: 127.0.0.1:23119\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn response_rewrite_appends_allow_origin() {
        let mut msg =
            Message::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").unwrap();
        rewrite_response(&mut msg);
        assert_eq!(
            msg.to_bytes(),
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nAccess-Control-Allow-Origin: *\r\n\r\nok"
        );
    }

    #[test]
    fn unavailable_response_is_well_formed() {
        let msg = Message::parse(SERVICE_UNAVAILABLE).unwrap();
        assert_eq!(msg.head.start_line, "HTTP/1.1 503 Service Unavailable");
        assert_eq!(msg.headers().get("content-type"), Some("text/plain"));
        assert_eq!(msg.body, b"Zotero is not running.");
    }
}
