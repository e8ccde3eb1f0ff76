//! InfluxDB v2 HTTP adapter
//!
//! Reads flow aggregates for a mission window with a Flux query and writes
//! classification points as line protocol. Both directions share one pooled
//! `reqwest` client with a short timeout.

use crate::domain::flow::{ClassifiedFlowControlMission, FlowDataSummary};
use crate::infra::config::Config;
use crate::services::pipeline::{AggregateSource, QueryError, ResultSink, SinkError};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use std::fmt::Write;
use std::time::Duration;
use tracing::debug;

/// Measurement name of written classification points
pub const CLASSIFICATION_MEASUREMENT: &str = "Classification";

pub struct InfluxClient {
    http: reqwest::Client,
    url: String,
    org: String,
    bucket: String,
    token: String,
    flowmeter_id: String,
}

impl InfluxClient {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.influx_timeout_ms()))
            .build()?;

        Ok(Self {
            http,
            url: config.influx_url().trim_end_matches('/').to_string(),
            org: config.influx_org().to_string(),
            bucket: config.influx_bucket().to_string(),
            token: config.influx_token().to_string(),
            flowmeter_id: config.flowmeter_id().to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.url, path)
    }

    fn authorization(&self) -> String {
        format!("Token {}", self.token)
    }
}

#[async_trait]
impl AggregateSource for InfluxClient {
    async fn flow_summary(
        &self,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Result<FlowDataSummary, QueryError> {
        let query = flux_query(&self.bucket, &self.flowmeter_id, start, end);

        let response = self
            .http
            .post(self.endpoint("/api/v2/query"))
            .query(&[("org", self.org.as_str())])
            .header(AUTHORIZATION, self.authorization())
            .header(CONTENT_TYPE, "application/vnd.flux")
            .header(ACCEPT, "application/csv")
            .body(query)
            .send()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| QueryError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(QueryError::Status { status: status.as_u16(), body });
        }

        let summary = FlowDataSummary::from_aggregates(parse_flux_csv(&body)?)?;
        debug!(
            volume = summary.volume,
            mean = summary.mean,
            peak = summary.peak,
            "flow_summary_fetched"
        );
        Ok(summary)
    }
}

#[async_trait]
impl ResultSink for InfluxClient {
    async fn write_classification(
        &self,
        record: &ClassifiedFlowControlMission,
    ) -> Result<(), SinkError> {
        let line = classification_line(record)?;

        let response = self
            .http
            .post(self.endpoint("/api/v2/write"))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(AUTHORIZATION, self.authorization())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status { status: status.as_u16(), body });
        }
        Ok(())
    }
}

/// Flux script yielding `Mean`, `Peak` and `Volume` for one flowmeter
pub fn flux_query(
    bucket: &str,
    flowmeter_id: &str,
    start: DateTime<FixedOffset>,
    end: DateTime<FixedOffset>,
) -> String {
    let start = start.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::AutoSi, true);
    let stop = end.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::AutoSi, true);
    let bucket = flux_string(bucket);
    let flowmeter_id = flux_string(flowmeter_id);

    format!(
        r#"data = from(bucket: "{bucket}")
    |> range(start: {start}, stop: {stop})
    |> filter(fn: (r) => r["_measurement"] == "flowmeter")
    |> filter(fn: (r) => r["_field"] == "reading")
    |> filter(fn: (r) => r["id"] == "{flowmeter_id}")

data
    |> mean(column: "_value")
    |> yield(name: "Mean")

data
    |> max(column: "_value")
    |> yield(name: "Peak")

data
    |> integral(unit: 1m, column: "_value")
    |> yield(name: "Volume")
"#
    )
}

fn flux_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[derive(Clone, Copy)]
enum TableHeader {
    Data { result: usize, value: usize },
    Error { message: usize },
}

/// Extract (result name, `_value`) pairs from a Flux CSV response
///
/// Tables are separated by blank lines, each starting with its own header
/// row. Annotation rows (`#...`) are skipped. An error table fails the parse.
pub fn parse_flux_csv(body: &str) -> Result<Vec<(String, f64)>, QueryError> {
    let mut rows = Vec::new();
    let mut header: Option<TableHeader> = None;

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            header = None;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let cells: Vec<&str> = line.split(',').map(unquote).collect();
        let position = |name: &str| cells.iter().position(|cell| *cell == name);

        match header {
            None => {
                header = Some(match (position("result"), position("_value"), position("error")) {
                    (Some(result), Some(value), _) => TableHeader::Data { result, value },
                    (_, _, Some(message)) => TableHeader::Error { message },
                    _ => return Err(QueryError::Parse(format!("unexpected header {line:?}"))),
                });
            }
            Some(TableHeader::Error { message }) => {
                let message = cells.get(message).copied().unwrap_or_default();
                return Err(QueryError::Flux(message.to_string()));
            }
            Some(TableHeader::Data { result, value }) => {
                let (Some(name), Some(raw)) = (cells.get(result), cells.get(value)) else {
                    return Err(QueryError::Parse(format!("short row {line:?}")));
                };
                let parsed = raw
                    .parse::<f64>()
                    .map_err(|_| QueryError::Parse(format!("non-numeric _value {raw:?}")))?;
                rows.push((name.to_string(), parsed));
            }
        }
    }

    Ok(rows)
}

fn unquote(cell: &str) -> &str {
    cell.strip_prefix('"').and_then(|c| c.strip_suffix('"')).unwrap_or(cell)
}

/// Line-protocol point for one classification
///
/// Every feature becomes a tag (sorted by key), the label is the `end_use`
/// string field, and the timestamp is the mission start in nanoseconds.
pub fn classification_line(record: &ClassifiedFlowControlMission) -> Result<String, SinkError> {
    let start = record.mission.start_ts();
    let timestamp =
        start.timestamp_nanos_opt().ok_or_else(|| SinkError::Timestamp(start.to_rfc3339()))?;

    let mut tags: Vec<(&str, String)> =
        record.features.named().map(|(name, value)| (name.as_str(), format!("{value:?}"))).collect();
    tags.sort_by(|a, b| a.0.cmp(b.0));

    let mut line = escape_measurement(CLASSIFICATION_MEASUREMENT);
    for (key, value) in &tags {
        let _ = write!(line, ",{}={}", escape_tag(key), escape_tag(value));
    }
    let _ = write!(
        line,
        " end_use=\"{}\" {timestamp}",
        escape_field_string(record.predicted_end_use.as_str())
    );
    Ok(line)
}

fn escape_measurement(value: &str) -> String {
    escape_chars(value, &[',', ' '])
}

fn escape_tag(value: &str) -> String {
    escape_chars(value, &[',', '=', ' '])
}

fn escape_field_string(value: &str) -> String {
    escape_chars(value, &['\\', '"'])
}

fn escape_chars(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::FlowClassifierFeatures;
    use crate::domain::mission::{
        CompletedFlowControlMission, EndUseType, FlowControlMission, TrajectoryPoint,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn ts(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn record() -> ClassifiedFlowControlMission {
        let mission = FlowControlMission::new(2, vec![TrajectoryPoint::new(0.0, 5.0)]).unwrap();
        ClassifiedFlowControlMission {
            mission: CompletedFlowControlMission::new(
                mission,
                ts("2022-01-01T00:00:00Z"),
                ts("2022-01-01T00:10:00Z"),
            )
            .unwrap(),
            features: FlowClassifierFeatures {
                volume: 24.0,
                mean: 1.2,
                peak: 3.0,
                duration: 1200.0,
                hour: 0.0,
            },
            predicted_end_use: EndUseType::Other,
        }
    }

    #[test]
    fn test_flux_query_window_in_utc() {
        let query = flux_query(
            "flow",
            "0",
            ts("2022-01-01T02:00:00+02:00"),
            ts("2022-01-01T00:10:00.500Z"),
        );
        assert!(query.contains(r#"from(bucket: "flow")"#));
        assert!(query.contains("range(start: 2022-01-01T00:00:00Z, stop: 2022-01-01T00:10:00.500Z)"));
        assert!(query.contains(r#"r["id"] == "0""#));
        assert!(query.contains(r#"yield(name: "Volume")"#));
        assert!(query.contains("integral(unit: 1m"));
    }

    #[test]
    fn test_flux_query_escapes_strings() {
        let query = flux_query(
            r#"fl"ow"#,
            "0",
            ts("2022-01-01T00:00:00Z"),
            ts("2022-01-01T00:10:00Z"),
        );
        assert!(query.contains(r#"from(bucket: "fl\"ow")"#));
    }

    #[test]
    fn test_parse_flux_csv_tables() {
        let body = "\
,result,table,_start,_stop,_value\r
,Mean,0,2022-01-01T00:00:00Z,2022-01-01T00:10:00Z,1.2\r
\r
,result,table,_start,_stop,_time,_value,_field,_measurement,id\r
,Peak,1,2022-01-01T00:00:00Z,2022-01-01T00:10:00Z,2022-01-01T00:03:00Z,3,reading,flowmeter,0\r
\r
,result,table,_start,_stop,_value\r
,Volume,2,2022-01-01T00:00:00Z,2022-01-01T00:10:00Z,12\r
\r
";
        let rows = parse_flux_csv(body).unwrap();
        assert_eq!(
            rows,
            vec![("Mean".to_string(), 1.2), ("Peak".to_string(), 3.0), ("Volume".to_string(), 12.0)]
        );
        let summary = FlowDataSummary::from_aggregates(rows).unwrap();
        assert_eq!(summary, FlowDataSummary { volume: 12.0, mean: 1.2, peak: 3.0 });
    }

    #[test]
    fn test_parse_flux_csv_skips_annotations() {
        let body = "#datatype,string,long,double\n#group,false,false,false\n,result,table,_value\n,Mean,0,2.5\n";
        assert_eq!(parse_flux_csv(body).unwrap(), vec![("Mean".to_string(), 2.5)]);
    }

    #[test]
    fn test_parse_flux_csv_empty_body() {
        assert!(parse_flux_csv("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_flux_csv_error_table() {
        let body = ",error,reference\n,bucket not found,\n";
        assert!(matches!(parse_flux_csv(body), Err(QueryError::Flux(ref m)) if m == "bucket not found"));
    }

    #[test]
    fn test_parse_flux_csv_bad_value() {
        let body = ",result,table,_value\n,Mean,0,abc\n";
        assert!(matches!(parse_flux_csv(body), Err(QueryError::Parse(_))));
    }

    #[test]
    fn test_classification_line() {
        let line = classification_line(&record()).unwrap();
        assert_eq!(
            line,
            "Classification,Duration=1200.0,Hour=0.0,Mean=1.2,Peak=3.0,Volume=24.0 \
             end_use=\"other\" 1640995200000000000"
        );
    }

    #[test]
    fn test_line_protocol_escaping() {
        assert_eq!(escape_tag("a b,c=d"), "a\\ b\\,c\\=d");
        assert_eq!(escape_field_string(r#"say "hi" \o/"#), r#"say \"hi\" \\o/"#);
        assert_eq!(escape_measurement("my measurement"), "my\\ measurement");
    }

    /// Accept one HTTP request, answer it, and hand back the raw request text
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            while !request_complete(&request) {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });

        (url, handle)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(head_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..head_end]
            .lines()
            .find_map(|line| {
                let (key, value) = line.split_once(':')?;
                if key.eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        request.len() >= head_end + 4 + length
    }

    fn client(url: &str) -> InfluxClient {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "INFLUXDB_URL" => Some(url.to_string()),
            "INFLUXDB_TOKEN" => Some("secret".to_string()),
            _ => None,
        });
        InfluxClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_flow_summary_over_http() {
        let (url, server) = serve_once(
            "200 OK",
            ",result,table,_value\r\n,Volume,0,12\r\n\r\n,result,table,_value\r\n,Mean,1,1.2\r\n\r\n,result,table,_value\r\n,Peak,2,3\r\n",
        )
        .await;

        let summary = client(&url)
            .flow_summary(ts("2022-01-01T00:00:00Z"), ts("2022-01-01T00:10:00Z"))
            .await
            .unwrap();
        assert_eq!(summary, FlowDataSummary { volume: 12.0, mean: 1.2, peak: 3.0 });

        let request = server.await.unwrap();
        let lower = request.to_lowercase();
        assert!(request.starts_with("POST /api/v2/query?org=crewstand "));
        assert!(lower.contains("authorization: token secret"));
        assert!(lower.contains("content-type: application/vnd.flux"));
        assert!(request.contains(r#"r["_measurement"] == "flowmeter""#));
    }

    #[tokio::test]
    async fn test_flow_summary_http_error() {
        let (url, _server) = serve_once("401 Unauthorized", "{\"code\":\"unauthorized\"}").await;
        let err = client(&url)
            .flow_summary(ts("2022-01-01T00:00:00Z"), ts("2022-01-01T00:10:00Z"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_write_classification_over_http() {
        let (url, server) = serve_once("204 No Content", "").await;
        client(&url).write_classification(&record()).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/v2/write?org=crewstand&bucket=flow&precision=ns "));
        assert!(request.ends_with("end_use=\"other\" 1640995200000000000"));
    }

    #[tokio::test]
    async fn test_write_classification_rejected() {
        let (url, _server) = serve_once("400 Bad Request", "bad line").await;
        let err = client(&url).write_classification(&record()).await.unwrap_err();
        assert!(matches!(err, SinkError::Status { status: 400, ref body } if body == "bad line"));
    }
}
