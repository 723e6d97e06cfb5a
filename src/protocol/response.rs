use std::fmt::Write as _;

use crate::protocol::parse::RequestHead;

/// Numeric return codes of an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReturnCode {
    Ok = 0,
    ReloadFailed = 90,
    StoreUnreachable = 95,
    HandlerError = 96,
    HandlerPanic = 97,
    /// Request exceeded the frame size limit and was discarded.
    RequestTooLarge = 98,
    UnsupportedOc = 99,
}

impl ReturnCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Escapes text for use as XML element content.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Synchronous acknowledgement of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub tn: String,
    pub rc: ReturnCode,
    pub msg: String,
    pub status: Option<String>,
    pub org: String,
}

impl Ack {
    /// Success ACK echoing the request's transaction number and organization.
    /// Link-alive requests get `STATUS` 1.
    pub fn for_request(head: &RequestHead) -> Self {
        Self {
            tn: head.tn.clone(),
            rc: ReturnCode::Ok,
            msg: String::new(),
            status: (head.oc == "LA").then(|| "1".to_string()),
            org: head.org.clone(),
        }
    }

    pub fn with_code(mut self, rc: ReturnCode) -> Self {
        self.rc = rc;
        self
    }

    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<SIHOT-Document>\n<OC>ACK</OC>\n");
        let _ = writeln!(xml, "<TN>{}</TN>", escape(&self.tn));
        let _ = writeln!(xml, "<RC>{}</RC>", self.rc.code());
        if !self.msg.is_empty() {
            let _ = writeln!(xml, "<MSG>{}</MSG>", escape(&self.msg));
        }
        if let Some(status) = &self.status {
            let _ = writeln!(xml, "<STATUS>{}</STATUS>", escape(status));
        }
        if !self.org.is_empty() {
            let _ = writeln!(xml, "<ORG>{}</ORG>", escape(&self.org));
        }
        xml.push_str("</SIHOT-Document>");
        xml
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse::{scan_value, RequestHead};

    #[test]
    fn test_link_alive_ack_carries_status() {
        let head = RequestHead::parse("<OC>LA</OC><TN>12</TN><ORG>SIHOT</ORG>");
        let xml = Ack::for_request(&head).to_xml();
        assert_eq!(scan_value(&xml, "OC").as_deref(), Some("ACK"));
        assert_eq!(scan_value(&xml, "TN").as_deref(), Some("12"));
        assert_eq!(scan_value(&xml, "RC").as_deref(), Some("0"));
        assert_eq!(scan_value(&xml, "STATUS").as_deref(), Some("1"));
        assert_eq!(scan_value(&xml, "ORG").as_deref(), Some("SIHOT"));
        assert!(!xml.contains("<MSG>"));
    }

    #[test]
    fn test_message_is_escaped() {
        let head = RequestHead::parse("<OC>GUEST-CHANGE</OC>");
        let xml = Ack::for_request(&head)
            .with_code(ReturnCode::HandlerError)
            .with_message("a < b & \"c\"")
            .to_xml();
        assert!(xml.contains("<MSG>a &lt; b &amp; &quot;c&quot;</MSG>"));
        assert_eq!(scan_value(&xml, "MSG").as_deref(), Some("a < b & \"c\""));
        assert_eq!(scan_value(&xml, "RC").as_deref(), Some("96"));
        assert!(!xml.contains("<STATUS>"));
    }
}
