//! Session description rewriting.
//!
//! Both transforms are pure string rewrites and idempotent.

use once_cell::sync::Lazy;
use regex::Regex;

static OPUS_RTPMAP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i):(\d+) opus/48000").expect("valid opus pattern"));

static CN_RTPMAP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)a=rtpmap:(\d+) CN/\d+").expect("valid cn pattern"));

static BANDWIDTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^b=AS:\d+").expect("valid bandwidth pattern"));

// `m=<media> <port> <proto>` precede the payload list
const M_LINE_FIXED_FIELDS: usize = 3;

/// Default bandwidth ceiling in kbps
pub const DEFAULT_BANDWIDTH_KBPS: u32 = 64;

/// Make Opus/48000 the default audio codec and drop comfort noise codecs.
pub fn prefer_opus(sdp: &str) -> String {
    let eol = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = sdp.split(eol).map(str::to_string).collect();

    let Some(m_index) = lines.iter().position(|l| l.starts_with("m=audio")) else {
        return sdp.to_string();
    };

    let opus = lines
        .iter()
        .find(|l| l.to_ascii_lowercase().contains("opus/48000"))
        .and_then(|l| OPUS_RTPMAP.captures(l))
        .map(|c| c[1].to_string());
    if let Some(payload) = opus {
        lines[m_index] = set_default_codec(&lines[m_index], &payload);
    }

    remove_cn(&mut lines, m_index);
    lines.join(eol)
}

/// Rewrite every `b=AS:` line to `kbps`.
pub fn set_bandwidth(sdp: &str, kbps: u32) -> String {
    BANDWIDTH
        .replace_all(sdp, format!("b=AS:{}", kbps).as_str())
        .into_owned()
}

fn split_m_line(m_line: &str) -> Option<(Vec<&str>, Vec<&str>)> {
    let elements: Vec<&str> = m_line.split(' ').collect();
    if elements.len() <= M_LINE_FIXED_FIELDS {
        return None;
    }
    let (head, codecs) = elements.split_at(M_LINE_FIXED_FIELDS);
    Some((head.to_vec(), codecs.to_vec()))
}

fn set_default_codec(m_line: &str, payload: &str) -> String {
    let Some((head, codecs)) = split_m_line(m_line) else {
        return m_line.to_string();
    };
    let mut out = head;
    out.push(payload);
    out.extend(codecs.into_iter().filter(|c| *c != payload));
    out.join(" ")
}

fn remove_cn(lines: &mut Vec<String>, m_index: usize) {
    let cn: Vec<String> = lines
        .iter()
        .filter_map(|l| CN_RTPMAP.captures(l).map(|c| c[1].to_string()))
        .collect();
    if cn.is_empty() {
        return;
    }

    if let Some((head, codecs)) = split_m_line(&lines[m_index]) {
        let mut out = head;
        out.extend(codecs.into_iter().filter(|c| !cn.iter().any(|p| p == c)));
        lines[m_index] = out.join(" ");
    }
    lines.retain(|l| !CN_RTPMAP.is_match(l));
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 42 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 1 RTP/SAVPF 103 104 111 0 8 106 105 13 126\r\n\
b=AS:30\r\n\
a=rtpmap:103 ISAC/16000\r\n\
a=rtpmap:104 ISAC/32000\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:106 CN/32000\r\n\
a=rtpmap:105 CN/16000\r\n\
a=rtpmap:13 CN/8000\r\n\
a=rtpmap:126 telephone-event/8000\r\n\
m=application 1 RTP/SAVPF 101\r\n\
b=AS:30\r\n";

    #[test]
    fn test_prefer_opus() {
        let out = prefer_opus(OFFER);
        let lines: Vec<&str> = out.split("\r\n").collect();
        assert!(lines.contains(&"m=audio 1 RTP/SAVPF 111 103 104 0 8 126"));
        assert!(!out.contains("CN/"));
        assert!(out.contains("a=rtpmap:111 opus/48000/2"));
        assert!(out.ends_with("\r\n"));
    }

    #[test]
    fn test_prefer_opus_idempotent() {
        let once = prefer_opus(OFFER);
        assert_eq!(prefer_opus(&once), once);
    }

    #[test]
    fn test_no_audio_is_untouched() {
        let sdp = "v=0\r\nm=video 1 RTP/SAVPF 100\r\n";
        assert_eq!(prefer_opus(sdp), sdp);
    }

    #[test]
    fn test_lf_line_endings() {
        let sdp = OFFER.replace("\r\n", "\n");
        let out = prefer_opus(&sdp);
        assert!(out.contains("m=audio 1 RTP/SAVPF 111 103 104 0 8 126\n"));
    }

    #[test]
    fn test_bandwidth() {
        let out = set_bandwidth(OFFER, DEFAULT_BANDWIDTH_KBPS);
        assert_eq!(out.matches("b=AS:64").count(), 2);
        assert!(!out.contains("b=AS:30"));
        assert_eq!(set_bandwidth(&out, DEFAULT_BANDWIDTH_KBPS), out);
    }
}
