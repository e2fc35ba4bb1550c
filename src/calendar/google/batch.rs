//! Google batch requests.
//!
//! A batch is a single `multipart/mixed` POST in which every part embeds one HTTP request. The
//! service answers with a `multipart/mixed` body holding one embedded HTTP response per part,
//! correlated through the `Content-ID` header.
//!
//! See: https://developers.google.com/calendar/api/guides/batch

use super::ClientError;
use reqwest::Method;
use uuid::Uuid;

/// One request embedded in a batch.
#[derive(Debug, Clone)]
pub(crate) struct BatchPart {
    method: Method,
    path: String,
    body: Option<String>,
}

impl BatchPart {
    /// `path` is the absolute path plus query of the embedded request, e.g.
    /// `/calendar/v3/calendars/abc/events`.
    pub fn new(method: Method, path: impl Into<String>) -> BatchPart {
        BatchPart {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn with_json_body(mut self, body: String) -> BatchPart {
        self.body = Some(body);
        self
    }
}

#[derive(Debug)]
pub(crate) struct BatchRequest {
    boundary: String,
    parts: Vec<BatchPart>,
}

impl BatchRequest {
    pub fn new(parts: Vec<BatchPart>) -> BatchRequest {
        BatchRequest {
            boundary: format!("batch_{}", Uuid::new_v4().simple()),
            parts,
        }
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn content_type(&self) -> String {
        format!("multipart/mixed; boundary={}", self.boundary)
    }

    pub fn body(&self) -> String {
        let mut body = String::new();

        for (index, part) in self.parts.iter().enumerate() {
            body.push_str(&format!("--{}\r\n", self.boundary));
            body.push_str("Content-Type: application/http\r\n");
            body.push_str(&format!("Content-ID: <item-{index}>\r\n\r\n"));
            body.push_str(&format!("{} {} HTTP/1.1\r\n", part.method, part.path));

            match &part.body {
                Some(json) => {
                    body.push_str("Content-Type: application/json; charset=UTF-8\r\n");
                    body.push_str(&format!("Content-Length: {}\r\n\r\n", json.len()));
                    body.push_str(json);
                    body.push_str("\r\n");
                }
                None => body.push_str("\r\n"),
            }
        }

        body.push_str(&format!("--{}--\r\n", self.boundary));
        body
    }
}

/// The embedded response to the request at `index` of the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BatchResponse {
    pub index: usize,
    pub status: u16,
    pub body: String,
}

impl BatchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Splits a batch response body into the embedded responses, ordered by request index.
pub(crate) fn parse_response(
    content_type: &str,
    body: &str,
    expected: usize,
) -> Result<Vec<BatchResponse>, ClientError> {
    let boundary = boundary_param(content_type).ok_or_else(|| {
        ClientError::MalformedBatch(format!("no boundary in content type `{content_type}`"))
    })?;
    let delimiter = format!("--{boundary}");

    let mut responses = Vec::with_capacity(expected);

    for (position, chunk) in body.split(delimiter.as_str()).skip(1).enumerate() {
        // The closing delimiter is followed by `--`.
        if chunk.starts_with("--") {
            break;
        }

        let chunk = chunk.trim_start_matches(|c| c == '\r' || c == '\n');
        let (headers, embedded) = split_head(chunk).ok_or_else(|| {
            ClientError::MalformedBatch(format!("part {position} has no embedded response"))
        })?;

        let index = content_id_index(headers).unwrap_or(position);
        let status = embedded
            .lines()
            .next()
            .and_then(|status_line| status_line.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| {
                ClientError::MalformedBatch(format!("part {position} has no HTTP status line"))
            })?;
        let body = split_head(embedded)
            .map(|(_, body)| body.trim_end().to_owned())
            .unwrap_or_default();

        responses.push(BatchResponse {
            index,
            status,
            body,
        });
    }

    if responses.len() != expected {
        return Err(ClientError::MalformedBatch(format!(
            "expected {expected} responses, got {}",
            responses.len()
        )));
    }

    responses.sort_by_key(|response| response.index);

    // With one part per request, the indices must be exactly `0..expected`.
    if let Some(response) = responses
        .iter()
        .enumerate()
        .find_map(|(position, response)| (response.index != position).then_some(response))
    {
        return Err(ClientError::MalformedBatch(format!(
            "response index {} is duplicated or out of range",
            response.index
        )));
    }

    Ok(responses)
}

fn boundary_param(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.eq_ignore_ascii_case("boundary")
            .then(|| value.trim_matches('"'))
    })
}

// Splits headers from the body at the first empty line.
fn split_head(text: &str) -> Option<(&str, &str)> {
    if let Some(at) = text.find("\r\n\r\n") {
        return Some((&text[..at], &text[at + 4..]));
    }

    text.find("\n\n").map(|at| (&text[..at], &text[at + 2..]))
}

// `Content-ID: <response-item-3>` -> 3
fn content_id_index(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("content-id") {
            return None;
        }

        value
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .rsplit('-')
            .next()?
            .parse()
            .ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = "--batch_xyz\r\n\
        Content-Type: application/http\r\n\
        Content-ID: <response-item-1>\r\n\
        \r\n\
        HTTP/1.1 404 Not Found\r\n\
        Content-Type: application/json; charset=UTF-8\r\n\
        \r\n\
        {\"error\": {\"code\": 404, \"message\": \"Not Found\"}}\r\n\
        --batch_xyz\r\n\
        Content-Type: application/http\r\n\
        Content-ID: <response-item-0>\r\n\
        \r\n\
        HTTP/1.1 204 No Content\r\n\
        Content-Length: 0\r\n\
        \r\n\
        \r\n\
        --batch_xyz--\r\n";

    #[test]
    fn encodes_parts_with_and_without_body() {
        let request = BatchRequest::new(vec![
            BatchPart::new(Method::DELETE, "/calendar/v3/calendars/abc/events/1?sendUpdates=all"),
            BatchPart::new(Method::POST, "/calendar/v3/calendars/abc/events")
                .with_json_body(r#"{"summary":"Keynote"}"#.to_owned()),
        ]);

        let boundary = request.boundary.clone();
        let body = request.body();

        assert_eq!(request.len(), 2);
        assert_eq!(
            request.content_type(),
            format!("multipart/mixed; boundary={boundary}")
        );
        assert!(body.starts_with(&format!("--{boundary}\r\n")));
        assert!(body.ends_with(&format!("--{boundary}--\r\n")));
        assert!(body.contains(
            "Content-ID: <item-0>\r\n\r\n\
             DELETE /calendar/v3/calendars/abc/events/1?sendUpdates=all HTTP/1.1\r\n\r\n"
        ));
        assert!(body.contains(
            "Content-ID: <item-1>\r\n\r\nPOST /calendar/v3/calendars/abc/events HTTP/1.1\r\n"
        ));
        assert!(body.contains("Content-Length: 21\r\n\r\n{\"summary\":\"Keynote\"}\r\n"));
    }

    #[test]
    fn parses_responses_in_request_order() {
        let responses =
            parse_response("multipart/mixed; boundary=batch_xyz", RESPONSE, 2).unwrap();

        assert_eq!(responses[0].index, 0);
        assert_eq!(responses[0].status, 204);
        assert!(responses[0].is_success());
        assert_eq!(responses[1].index, 1);
        assert_eq!(responses[1].status, 404);
        assert!(!responses[1].is_success());
        assert!(responses[1].body.contains("Not Found"));
    }

    #[test]
    fn accepts_quoted_boundary() {
        let responses =
            parse_response("multipart/mixed; boundary=\"batch_xyz\"", RESPONSE, 2).unwrap();

        assert_eq!(responses.len(), 2);
    }

    #[test]
    fn rejects_missing_boundary() {
        assert!(matches!(
            parse_response("application/json", RESPONSE, 2),
            Err(ClientError::MalformedBatch(_))
        ));
    }

    #[test]
    fn rejects_unexpected_number_of_parts() {
        assert!(matches!(
            parse_response("multipart/mixed; boundary=batch_xyz", RESPONSE, 3),
            Err(ClientError::MalformedBatch(_))
        ));
    }

    #[test]
    fn rejects_duplicated_content_id() {
        let body = RESPONSE.replace("<response-item-1>", "<response-item-0>");

        let err = parse_response("multipart/mixed; boundary=batch_xyz", &body, 2).unwrap_err();

        assert!(matches!(err, ClientError::MalformedBatch(message) if message.contains("index 0")));
    }

    #[test]
    fn rejects_out_of_range_content_id() {
        let body = RESPONSE.replace("<response-item-1>", "<response-item-7>");

        let err = parse_response("multipart/mixed; boundary=batch_xyz", &body, 2).unwrap_err();

        assert!(matches!(err, ClientError::MalformedBatch(message) if message.contains("index 7")));
    }

    #[test]
    fn falls_back_to_position_without_content_id() {
        let body = "--b\nContent-Type: application/http\n\nHTTP/1.1 200 OK\n\n{}\n--b--\n";

        let responses = parse_response("multipart/mixed; boundary=b", body, 1).unwrap();

        assert_eq!(
            responses,
            vec![BatchResponse {
                index: 0,
                status: 200,
                body: "{}".into()
            }]
        );
    }
}
