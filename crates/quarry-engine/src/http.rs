//! HTTP endpoint of a node.
//!
//! Minimal HTTP/1.1: one request per connection, `Content-Length` bodies,
//! JSON responses shaped like the classic search REST API:
//! - `GET /`, `GET /_cluster/health[/{index}]`
//! - `GET|POST [/{index}[/{type}]]/_search`, `GET|POST [/{index}]/_count`
//! - `POST [/{index}]/_refresh|_flush|_optimize`
//! - `PUT|HEAD|DELETE /{index}`, `PUT /{index}/_mapping/{type}`
//! - `POST /{index}/{type}`, `PUT|POST|GET|DELETE /{index}/{type}/{id}`

use std::collections::BTreeMap;
use std::fmt;

use bytes::BytesMut;
use quarry_types::{Query, SearchHit, SearchRequest, Settings, Sort, SortOrder};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{Client, EngineError};

/// Upper bound on the request line plus headers.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Upper bound on a request body.
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

const DEFAULT_PAGE_SIZE: usize = 10;

/// A parsed HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpRequest {
    pub method: String,
    /// Percent-decoded path segments.
    pub segments: Vec<String>,
    pub params: BTreeMap<String, String>,
    pub body: String,
}

impl HttpRequest {
    fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Request bytes that are not valid HTTP.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum ParseError {
    #[error("malformed request line")]
    RequestLine,
    #[error("invalid header: {0}")]
    Header(String),
    #[error("request exceeds {0} bytes")]
    TooLarge(usize),
    #[error("request is not valid UTF-8")]
    Utf8,
}

/// Takes one complete request off the front of `buf`.
///
/// Returns `Ok(None)` until the head and the whole body have arrived.
pub(crate) fn parse_request(buf: &mut BytesMut) -> Result<Option<HttpRequest>, ParseError> {
    let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        if buf.len() > MAX_HEAD_SIZE {
            return Err(ParseError::TooLarge(MAX_HEAD_SIZE));
        }
        return Ok(None);
    };

    let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| ParseError::Utf8)?;
    let mut lines = head.split("\r\n");
    let mut parts = lines.next().ok_or(ParseError::RequestLine)?.split_whitespace();
    let (Some(method), Some(target), Some(_version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::RequestLine);
    };

    let mut content_length = 0usize;
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::Header(line.to_string()))?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = value
                .trim()
                .parse()
                .map_err(|_| ParseError::Header(line.to_string()))?;
        }
    }
    if content_length > MAX_BODY_SIZE {
        return Err(ParseError::TooLarge(MAX_BODY_SIZE));
    }

    let body_start = head_end + 4;
    if buf.len() < body_start + content_length {
        return Ok(None);
    }

    let method = method.to_ascii_uppercase();
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let segments = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| percent_decode(s, false))
        .collect();
    let params = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(k, true), percent_decode(v, true))
        })
        .collect();

    let raw = buf.split_to(body_start + content_length);
    let body = std::str::from_utf8(&raw[body_start..])
        .map_err(|_| ParseError::Utf8)?
        .to_string();

    Ok(Some(HttpRequest {
        method,
        segments,
        params,
        body,
    }))
}

/// Decodes `%XX` escapes; in query strings `+` is a space.
fn percent_decode(input: &str, plus_as_space: bool) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b'+' if plus_as_space => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Status plus JSON body; `None` bodies are sent empty.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HttpResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl HttpResponse {
    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    fn empty(status: u16) -> Self {
        Self { status, body: None }
    }

    /// Serialises the full response.
    pub fn to_http(&self) -> String {
        match &self.body {
            Some(body) => http_response(self.status, "application/json; charset=UTF-8", &body.to_string()),
            None => http_response(self.status, "text/plain; charset=UTF-8", ""),
        }
    }
}

/// Error turned into a JSON error response.
#[derive(Debug)]
struct HttpError {
    status: u16,
    message: String,
}

impl HttpError {
    fn bad_request(message: impl fmt::Display) -> Self {
        Self {
            status: 400,
            message: message.to_string(),
        }
    }
}

impl From<EngineError> for HttpError {
    fn from(error: EngineError) -> Self {
        Self {
            status: error.http_status(),
            message: error.to_string(),
        }
    }
}

impl From<HttpError> for HttpResponse {
    fn from(error: HttpError) -> Self {
        Self::json(
            error.status,
            json!({ "error": error.message, "status": error.status }),
        )
    }
}

/// Build a minimal HTTP/1.1 response.
pub(crate) fn http_response(status: u16, content_type: &str, body: &str) -> String {
    let reason = match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    };

    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
}

/// Response for bytes that never parsed into a request.
pub(crate) fn parse_error_response(error: &ParseError) -> String {
    HttpResponse::from(HttpError::bad_request(error)).to_http()
}

// ============================================================================
// Routing
// ============================================================================

/// Dispatch a request to the appropriate handler.
#[instrument(skip_all, fields(method = %request.method, path = %request.segments.join("/")))]
pub(crate) fn dispatch(client: &dyn Client, node_name: &str, request: &HttpRequest) -> HttpResponse {
    let response = route(client, node_name, request).unwrap_or_else(HttpResponse::from);
    debug!(status = response.status, "http request served");
    if request.method == "HEAD" {
        HttpResponse::empty(response.status)
    } else {
        response
    }
}

fn route(client: &dyn Client, node_name: &str, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
    let segments: Vec<&str> = request.segments.iter().map(String::as_str).collect();
    match (request.method.as_str(), segments.as_slice()) {
        ("GET" | "HEAD", []) => {
            let state = client.cluster_state()?;
            Ok(HttpResponse::json(
                200,
                json!({
                    "status": 200,
                    "name": node_name,
                    "cluster_name": state.cluster_name,
                    "version": { "number": env!("CARGO_PKG_VERSION") },
                    "tagline": "You Know, for Search",
                }),
            ))
        }
        ("GET", ["_cluster", "health"]) => health(client, None),
        ("GET", ["_cluster", "health", index]) => health(client, Some(*index)),
        ("GET" | "POST", ["_search"]) => search(client, None, None, request),
        ("GET" | "POST", ["_count"]) => count(client, None, None, request),
        ("POST", ["_refresh"]) => ack(client.refresh(None)),
        ("POST", ["_flush"]) => ack(client.flush(None)),
        ("POST", ["_optimize"]) => ack(client.optimize(None, only_expunge_deletes(request)?)),
        ("GET" | "POST", [index, "_search"]) => search(client, Some(*index), None, request),
        ("GET" | "POST", [index, "_count"]) => count(client, Some(*index), None, request),
        ("POST", [index, "_refresh"]) => ack(client.refresh(Some(*index))),
        ("POST", [index, "_flush"]) => ack(client.flush(Some(*index))),
        ("POST", [index, "_optimize"]) => {
            ack(client.optimize(Some(*index), only_expunge_deletes(request)?))
        }
        ("PUT" | "POST", [index, "_mapping", doc_type]) => {
            client.put_mapping(index, doc_type, non_empty_body(request)?)?;
            Ok(acknowledged())
        }
        ("GET" | "POST", [index, doc_type, "_search"]) => {
            search(client, Some(*index), Some(*doc_type), request)
        }
        ("GET" | "POST", [index, doc_type, "_count"]) => {
            count(client, Some(*index), Some(*doc_type), request)
        }
        ("PUT", [index]) => create_index(client, index, &request.body),
        ("HEAD", [index]) => Ok(HttpResponse::empty(if client.index_exists(index)? {
            200
        } else {
            404
        })),
        ("DELETE", [index]) => {
            client.delete_index(index)?;
            Ok(acknowledged())
        }
        ("POST", [index, doc_type]) => index_doc(client, index, doc_type, None, request),
        ("PUT" | "POST", [index, doc_type, id]) => {
            index_doc(client, index, doc_type, Some(*id), request)
        }
        ("GET", [index, doc_type, id]) => {
            let got = client.get(index, doc_type, id)?;
            let mut body = json!({
                "_index": got.index,
                "_type": got.doc_type,
                "_id": got.id,
                "found": got.found,
            });
            if let Some(source) = &got.source {
                body["_version"] = json!(got.version);
                body["_source"] = parse_source(source);
            }
            Ok(HttpResponse::json(if got.found { 200 } else { 404 }, body))
        }
        ("DELETE", [index, doc_type, id]) => {
            let deleted = client.delete(index, doc_type, id)?;
            Ok(HttpResponse::json(
                if deleted.found { 200 } else { 404 },
                json!({
                    "found": deleted.found,
                    "_index": deleted.index,
                    "_type": deleted.doc_type,
                    "_id": deleted.id,
                    "_version": deleted.version,
                }),
            ))
        }
        (method, _) => Err(HttpError::bad_request(format!(
            "no handler found for uri [/{}] and method [{method}]",
            request.segments.join("/")
        ))),
    }
}

fn acknowledged() -> HttpResponse {
    HttpResponse::json(200, json!({ "acknowledged": true }))
}

fn ack(result: Result<(), EngineError>) -> Result<HttpResponse, HttpError> {
    result?;
    Ok(HttpResponse::json(200, json!({ "_shards": { "failed": 0 } })))
}

fn non_empty_body(request: &HttpRequest) -> Result<&str, HttpError> {
    if request.body.trim().is_empty() {
        return Err(HttpError::bad_request("request body is required"));
    }
    Ok(&request.body)
}

fn only_expunge_deletes(request: &HttpRequest) -> Result<bool, HttpError> {
    request
        .param("only_expunge_deletes")
        .map_or(Ok(false), |v| v.parse().map_err(HttpError::bad_request))
}

fn parse_source(source: &str) -> Value {
    serde_json::from_str(source).unwrap_or_else(|_| Value::String(source.to_string()))
}

fn health(client: &dyn Client, index: Option<&str>) -> Result<HttpResponse, HttpError> {
    let health = client.cluster_health(index)?;
    let body = serde_json::to_value(&health).map_err(|e| HttpError {
        status: 500,
        message: e.to_string(),
    })?;
    Ok(HttpResponse::json(200, body))
}

fn index_doc(
    client: &dyn Client,
    index: &str,
    doc_type: &str,
    id: Option<&str>,
    request: &HttpRequest,
) -> Result<HttpResponse, HttpError> {
    let indexed = client.index(index, doc_type, id, non_empty_body(request)?)?;
    Ok(HttpResponse::json(
        if indexed.created { 201 } else { 200 },
        json!({
            "_index": indexed.index,
            "_type": indexed.doc_type,
            "_id": indexed.id,
            "_version": indexed.version,
            "created": indexed.created,
        }),
    ))
}

/// `PUT /{index}` with an optional `{"settings": .., "mappings": ..}` body.
fn create_index(client: &dyn Client, index: &str, body: &str) -> Result<HttpResponse, HttpError> {
    let body: Value = if body.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(body).map_err(HttpError::bad_request)?
    };

    let mut settings = Settings::builder();
    if let Some(Value::Object(map)) = body.get("settings") {
        flatten_settings("", map, &mut |key, value| {
            let key = if key.starts_with("index.") {
                key
            } else {
                format!("index.{key}")
            };
            settings.put(key, value);
        });
    }
    client.create_index(index, &settings.build())?;

    if let Some(Value::Object(mappings)) = body.get("mappings") {
        for (doc_type, mapping) in mappings {
            client.put_mapping(index, doc_type, &mapping.to_string())?;
        }
    }
    Ok(acknowledged())
}

fn flatten_settings(prefix: &str, map: &Map<String, Value>, put: &mut impl FnMut(String, String)) {
    for (key, value) in map {
        let key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(inner) => flatten_settings(&key, inner, put),
            Value::String(s) => put(key, s.clone()),
            other => put(key, other.to_string()),
        }
    }
}

// ============================================================================
// Search
// ============================================================================

fn search(
    client: &dyn Client,
    index: Option<&str>,
    doc_type: Option<&str>,
    request: &HttpRequest,
) -> Result<HttpResponse, HttpError> {
    let search = search_request(index, doc_type, request)?;
    let response = client.search(&search)?;
    let hits: Vec<Value> = response.hits.iter().map(hit_json).collect();
    Ok(HttpResponse::json(
        200,
        json!({
            "took": response.took_ms,
            "timed_out": response.timed_out,
            "hits": {
                "total": response.total_hits,
                "max_score": 1.0,
                "hits": hits,
            },
        }),
    ))
}

fn count(
    client: &dyn Client,
    index: Option<&str>,
    doc_type: Option<&str>,
    request: &HttpRequest,
) -> Result<HttpResponse, HttpError> {
    let search = search_request(index, doc_type, request)?;
    let count = client.count(index, doc_type, &search.query)?;
    Ok(HttpResponse::json(200, json!({ "count": count })))
}

fn hit_json(hit: &SearchHit) -> Value {
    json!({
        "_index": hit.index,
        "_type": hit.doc_type,
        "_id": hit.id,
        "_score": 1.0,
        "_source": parse_source(&hit.source),
    })
}

/// Builds a search from URL parameters, then lets a JSON body override them.
fn search_request(
    index: Option<&str>,
    doc_type: Option<&str>,
    request: &HttpRequest,
) -> Result<SearchRequest, HttpError> {
    let mut search = match index {
        Some(index) => SearchRequest::new(index),
        None => SearchRequest::all_indices(),
    };
    if let Some(doc_type) = doc_type {
        search = search.doc_type(doc_type);
    }

    if let Some(q) = request.param("q") {
        search = search.query(Query::query_string(q));
    }
    let from = parse_usize(request.param("from"), "from")?.unwrap_or(0);
    let size = parse_usize(request.param("size"), "size")?.unwrap_or(DEFAULT_PAGE_SIZE);
    search = search.page(from, size);
    if let Some(sort) = request.param("sort") {
        search = search.sort(parse_sort_param(sort)?);
    }

    if request.body.trim().is_empty() {
        return Ok(search);
    }
    let body: Value = serde_json::from_str(&request.body).map_err(HttpError::bad_request)?;
    if let Some(query) = body.get("query") {
        search = search.query(parse_query_dsl(query)?);
    }
    if let Some(from) = body.get("from").and_then(Value::as_u64) {
        search.from = from as usize;
    }
    if let Some(size) = body.get("size").and_then(Value::as_u64) {
        search.size = size as usize;
    }
    if let Some(sort) = body.get("sort") {
        search = search.sort(parse_sort_dsl(sort)?);
    }
    Ok(search)
}

fn parse_usize(value: Option<&str>, name: &str) -> Result<Option<usize>, HttpError> {
    value
        .map(|v| {
            v.parse()
                .map_err(|_| HttpError::bad_request(format!("invalid {name}: {v}")))
        })
        .transpose()
}

fn parse_order(order: &str) -> Result<SortOrder, HttpError> {
    match order.to_ascii_lowercase().as_str() {
        "asc" => Ok(SortOrder::Asc),
        "desc" => Ok(SortOrder::Desc),
        other => Err(HttpError::bad_request(format!("invalid sort order: {other}"))),
    }
}

/// `field` or `field:asc|desc`.
fn parse_sort_param(sort: &str) -> Result<Sort, HttpError> {
    match sort.split_once(':') {
        Some((field, order)) => Ok(Sort::field(field).order(parse_order(order)?)),
        None => Ok(Sort::field(sort)),
    }
}

/// `"field"`, `{"field": "desc"}`, `{"field": {"order": "desc"}}`, or an
/// array whose first element is one of those.
fn parse_sort_dsl(sort: &Value) -> Result<Sort, HttpError> {
    match sort {
        Value::String(field) => Ok(Sort::field(field.as_str())),
        Value::Array(items) => items
            .first()
            .ok_or_else(|| HttpError::bad_request("empty sort"))
            .and_then(parse_sort_dsl),
        Value::Object(map) => {
            let (field, spec) = map
                .iter()
                .next()
                .ok_or_else(|| HttpError::bad_request("empty sort"))?;
            let order = match spec {
                Value::String(order) => parse_order(order)?,
                Value::Object(inner) => match inner.get("order").and_then(Value::as_str) {
                    Some(order) => parse_order(order)?,
                    None => SortOrder::Asc,
                },
                _ => return Err(HttpError::bad_request("invalid sort")),
            };
            Ok(Sort::field(field.as_str()).order(order))
        }
        _ => Err(HttpError::bad_request("invalid sort")),
    }
}

/// `match_all`, `term` and `query_string` query bodies.
fn parse_query_dsl(query: &Value) -> Result<Query, HttpError> {
    let Some((kind, spec)) = query.as_object().and_then(|m| m.iter().next()) else {
        return Err(HttpError::bad_request("empty query"));
    };
    match kind.as_str() {
        "match_all" => Ok(Query::MatchAll),
        "term" => {
            let (field, value) = spec
                .as_object()
                .and_then(|m| m.iter().next())
                .ok_or_else(|| HttpError::bad_request("term query needs a field"))?;
            let value = match value {
                Value::Object(inner) => inner.get("value").unwrap_or(&Value::Null),
                other => other,
            };
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok(Query::term(field.as_str(), value))
        }
        "query_string" => spec
            .get("query")
            .and_then(Value::as_str)
            .map(Query::query_string)
            .ok_or_else(|| HttpError::bad_request("query_string needs a query")),
        other => Err(HttpError::bad_request(format!("unsupported query: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn parse(raw: &str) -> HttpRequest {
        let mut buf = BytesMut::from(raw.as_bytes());
        parse_request(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_parse_request_with_query_and_body() {
        let req = parse(
            "POST /my%20index/doc?q=msg:test+1&size=5 HTTP/1.1\r\n\
             Host: localhost\r\n\
             Content-Length: 2\r\n\
             \r\n\
             {}",
        );
        assert_eq!(req.method, "POST");
        assert_eq!(req.segments, vec!["my index", "doc"]);
        assert_eq!(req.param("q"), Some("msg:test 1"));
        assert_eq!(req.param("size"), Some("5"));
        assert_eq!(req.body, "{}");
    }

    #[test]
    fn test_parse_request_waits_for_body() {
        let mut buf = BytesMut::from(&b"PUT /i HTTP/1.1\r\nContent-Length: 11\r\n\r\n{\"a\""[..]);
        assert_eq!(parse_request(&mut buf), Ok(None));
        buf.extend_from_slice(b":12345}");
        let req = parse_request(&mut buf).unwrap().unwrap();
        assert_eq!(req.body, "{\"a\":12345}");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_request_rejects_garbage() {
        let mut buf = BytesMut::from(&b"NONSENSE\r\n\r\n"[..]);
        assert_eq!(parse_request(&mut buf), Err(ParseError::RequestLine));
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%2Fb", false), "a/b");
        assert_eq!(percent_decode("a+b", false), "a+b");
        assert_eq!(percent_decode("a+b", true), "a b");
        assert_eq!(percent_decode("100%", false), "100%");
    }

    #[test]
    fn test_http_response_format() {
        let resp = http_response(201, "application/json", "{}");
        assert!(resp.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(resp.contains("Content-Length: 2\r\n"));
        assert!(resp.ends_with("{}"));
    }

    #[test_case("order", "order", SortOrder::Asc; "bare field")]
    #[test_case("order:desc", "order", SortOrder::Desc; "explicit desc")]
    #[test_case("id:ASC", "id", SortOrder::Asc; "uppercase order")]
    fn test_sort_param(raw: &str, field: &str, order: SortOrder) {
        assert_eq!(parse_sort_param(raw).unwrap(), Sort::field(field).order(order));
    }

    #[test_case(json!({"match_all": {}}), Query::MatchAll; "match all")]
    #[test_case(json!({"term": {"id": "7"}}), Query::term("id", "7"); "term")]
    #[test_case(json!({"term": {"order": {"value": 7}}}), Query::term("order", 7); "term with value")]
    #[test_case(json!({"query_string": {"query": "msg:test"}}), Query::query_string("msg:test"); "query string")]
    fn test_query_dsl(body: Value, expected: Query) {
        assert_eq!(parse_query_dsl(&body).unwrap(), expected);
    }

    #[test]
    fn test_sort_dsl_forms() {
        let desc = Sort::field("id").order(SortOrder::Desc);
        assert_eq!(parse_sort_dsl(&json!("id")).unwrap(), Sort::field("id"));
        assert_eq!(parse_sort_dsl(&json!([{"id": "desc"}])).unwrap(), desc);
        assert_eq!(parse_sort_dsl(&json!({"id": {"order": "desc"}})).unwrap(), desc);
    }

    #[test]
    fn test_flatten_settings_prefixes_index() {
        let body = json!({"number_of_shards": 2, "index": {"number_of_replicas": 0}});
        let mut out = BTreeMap::new();
        flatten_settings("", body.as_object().unwrap(), &mut |k, v| {
            out.insert(k, v);
        });
        assert_eq!(out.get("number_of_shards").map(String::as_str), Some("2"));
        assert_eq!(
            out.get("index.number_of_replicas").map(String::as_str),
            Some("0")
        );
    }
}
