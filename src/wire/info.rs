use arrayref::array_ref;
use base64::Engine as _;

use super::proto::{MessageType, ProtoHeader, PROTO_HEADER_SIZE};
use crate::{
    error::{Error, Result, ResultCode},
    net::{Deadline, Socket},
};

/// Info responses larger than this are rejected unless the caller raises the
/// limit.
pub const DEFAULT_MAX_RESPONSE: usize = 2 * 1024 * 1024;

/// Builds an info request frame. Unless `as_is`, the caller-facing
/// separators `;`, `:` and `,` are turned into the newline that separates
/// names on the wire. A trailing newline is always present.
pub fn encode_request(names: &str, as_is: bool) -> Vec<u8> {
    let mut body: Vec<u8> = if as_is {
        names.as_bytes().to_vec()
    } else {
        names
            .bytes()
            .map(|b| match b {
                b';' | b':' | b',' => b'\n',
                other => other,
            })
            .collect()
    };
    if !body.is_empty() && body.last() != Some(&b'\n') {
        body.push(b'\n');
    }
    let mut buf = Vec::with_capacity(PROTO_HEADER_SIZE + body.len());
    buf.extend_from_slice(&ProtoHeader::new(MessageType::Info, body.len()).to_bytes());
    buf.extend_from_slice(&body);
    buf
}

/// Name/value pairs of an info response, in the order returned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InfoResponse(pub Vec<(String, String)>);

impl InfoResponse {
    /// Parses `name1\tvalue1\nname2\tvalue2\n...`. A name without a tab
    /// gets an empty value.
    pub fn parse(text: &str) -> Self {
        let pairs = text
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(|line| match line.split_once('\t') {
                Some((name, value)) => (name.to_owned(), value.to_owned()),
                None => (line.to_owned(), String::new()),
            })
            .collect();
        Self(pairs)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Like [`get`](Self::get), but a missing name is a client error.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| Error::client(format!("Info response missing '{}'", name)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Value of a single name response: the text after the first tab, up to the
/// newline.
pub fn parse_single_response(text: &str) -> Result<&str> {
    let (_, rest) = text
        .split_once('\t')
        .ok_or_else(|| Error::client("Invalid info response"))?;
    let (value, _) = rest
        .split_once('\n')
        .ok_or_else(|| Error::client("Invalid info response"))?;
    Ok(value)
}

/// Surfaces errors the server embeds in an info response: `ERROR:` at the
/// start, or `ERROR:`, `FAIL:` or a UDF `error=` after a tab.
pub fn validate_response(text: &str) -> Result<()> {
    if let Some(rest) = text.strip_prefix("ERROR:") {
        Err(parse_error(rest))?
    }
    for (i, _) in text.match_indices('\t') {
        let rest = &text[i + 1..];
        if let Some(rest) = rest.strip_prefix("ERROR:") {
            Err(parse_error(rest))?
        }
        if let Some(rest) = rest.strip_prefix("FAIL:") {
            Err(parse_error(rest))?
        }
        if rest.starts_with("error=") {
            Err(Error::new(ResultCode::Udf, decode_udf_error(rest)))?
        }
    }
    Ok(())
}

/// `[<code>][:<message>]`, terminated by a tab or newline.
fn parse_error(s: &str) -> Error {
    let s = s
        .split(|c| c == '\t' || c == '\n')
        .next()
        .unwrap_or_default();
    match s.split_once(':') {
        Some((code, message)) => {
            let code = match code.trim().parse::<i32>() {
                Ok(0) | Err(_) => ResultCode::Server,
                Ok(code) => ResultCode::from(code),
            };
            Error::new(code, message)
        }
        None => Error::new(ResultCode::Server, s),
    }
}

/// `<error message>;file=<file>;line=<line>;message=<base64 message>`
fn decode_udf_error(s: &str) -> String {
    let s = s.trim_end_matches('\n');
    if let Some(i) = s.find("message=") {
        let encoded = &s[i + 8..];
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) {
            return format!("{}{}", &s[..i + 8], String::from_utf8_lossy(&decoded));
        }
    }
    s.to_owned()
}

/// Sends an info request on `socket` and returns the validated response
/// text.
pub fn request(
    socket: &mut Socket,
    names: &str,
    as_is: bool,
    deadline: Deadline,
    max_response: usize,
) -> Result<String> {
    let req = encode_request(names, as_is);
    socket.write_all(&req, std::time::Duration::ZERO, deadline)?;

    let mut header = [0u8; PROTO_HEADER_SIZE];
    socket.read_exact(&mut header, std::time::Duration::ZERO, deadline)?;
    let header = ProtoHeader::parse(array_ref![header, 0, PROTO_HEADER_SIZE]);
    let size = header.size as usize;
    if size == 0 {
        return Ok(String::new());
    }
    if max_response > 0 && size > max_response {
        let mut peek = vec![0u8; size.min(100)];
        socket.read_exact(&mut peek, std::time::Duration::ZERO, deadline)?;
        Err(Error::client(format!(
            "Info request '{}' failed. Response buffer length {} is excessive. Buffer: {}",
            names,
            size,
            String::from_utf8_lossy(&peek)
        )))?
    }
    let mut body = vec![0u8; size];
    socket.read_exact(&mut body, std::time::Duration::ZERO, deadline)?;
    let text = String::from_utf8(body)
        .map_err(|_| Error::client(format!("Info request '{}' returned invalid UTF-8", names)))?;
    validate_response(&text)?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_become_newlines() {
        let req = encode_request("node;features,partition-generation", false);
        assert_eq!(&req[8..], b"node\nfeatures\npartition-generation\n");
        assert_eq!(req[1], MessageType::Info as u8);

        let req = encode_request("cluster-stable:namespace=test\n", true);
        assert_eq!(&req[8..], b"cluster-stable:namespace=test\n");
    }

    #[test]
    fn responses_keep_their_order() {
        let resp = InfoResponse::parse("node\tBB9\npeers-generation\t3\nfeatures\n");
        assert_eq!(resp.get("node"), Some("BB9"));
        assert_eq!(resp.get("features"), Some(""));
        assert_eq!(resp.iter().map(|(n, _)| n).collect::<Vec<_>>(), [
            "node",
            "peers-generation",
            "features"
        ]);
        assert!(resp.require("partitions").is_err());
    }

    #[test]
    fn single_response_value() {
        assert_eq!(parse_single_response("node\tBB9\n").unwrap(), "BB9");
        assert!(parse_single_response("node").is_err());
    }

    #[test]
    fn embedded_errors_are_decoded() {
        let err = validate_response("ERROR:4:bad request\n").unwrap_err();
        assert_eq!(err.code, ResultCode::RequestInvalid);
        assert_eq!(err.message, "bad request");

        let err = validate_response("sindex-create\tFAIL:oops\n").unwrap_err();
        assert_eq!(err.code, ResultCode::Server);

        let err = validate_response("udf-put\terror=compile;message=Ym9vbQ==\n").unwrap_err();
        assert_eq!(err.code, ResultCode::Udf);
        assert!(err.message.ends_with("message=boom"));

        assert!(validate_response("node\tBB9\n").is_ok());
    }
}
