use bytes::BytesMut;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use tokio_util::codec::Decoder;

/// Search response or announcement received from a device.
///
/// Header names are stored lower-cased.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct SsdpMessage {
    headers: HashMap<String, String>,
}

impl SsdpMessage {
    /// Parses a datagram, keeping only HTTP responses and `NOTIFY` requests that carry an `ST` header.
    pub fn parse(datagram: &str) -> Option<Self> {
        let first_line = datagram.lines().next()?;
        if !first_line.starts_with("HTTP") && !first_line.starts_with("NOTIFY") {
            return None;
        }
        let headers = parse_headers(datagram);
        if headers.contains_key("st") {
            Some(Self { headers })
        } else {
            None
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn st(&self) -> Option<&str> {
        self.header("st")
    }

    pub fn location(&self) -> Option<&str> {
        self.header("location")
    }

    pub fn usn(&self) -> Option<&str> {
        self.header("usn")
    }

    pub fn server(&self) -> Option<&str> {
        self.header("server")
    }
}

impl From<HashMap<String, String>> for SsdpMessage {
    fn from(headers: HashMap<String, String>) -> Self {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self { headers }
    }
}

/// Parses a MIME-style header block.
///
/// Every line containing a colon becomes an entry keyed by the lower-cased text before the first colon.
/// Lines without a colon, such as the start line, are skipped.
pub fn parse_headers(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_owned()))
        .collect()
}

/// Builds the `M-SEARCH` datagram looking for `search_target`.
pub fn search_query(search_target: &str, multicast_address: SocketAddrV4) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 1\r\n\
         ST: {}\r\n\
         \r\n",
        multicast_address, search_target
    )
}

/// Decodes one datagram into an [SsdpMessage], silently skipping anything else.
#[derive(Default)]
pub struct SsdpCodec;

impl Decoder for SsdpCodec {
    type Item = SsdpMessage;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split();
        let message = SsdpMessage::parse(&String::from_utf8_lossy(&datagram));
        if message.is_none() {
            log::debug!("Dropping a datagram that is not an SSDP reply");
        }
        Ok(message)
    }
}
