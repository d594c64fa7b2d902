//! SDP codec filtering.
//!
//! The sink runs on TV browsers with poor VP8 and AV1 hardware support, so
//! both are stripped from every description sent over the signaling
//! channel. The locally-set description is never filtered; the local
//! encoder stays free to pick among everything the stack advertises.

/// Codecs removed from transmitted descriptions.
pub const FILTERED_CODECS: &[&str] = &["VP8", "AV1"];

/// Remove the filtered codecs' payload types from an SDP description.
///
/// Scans `a=rtpmap` lines for the unwanted codecs, drops every `a=rtpmap`,
/// `a=rtcp-fb`, and `a=fmtp` line for those payload types, removes the
/// payload numbers from each `m=video` line, and rejoins with CRLF. All
/// other lines pass through verbatim.
pub fn filter_codecs(sdp: &str) -> String {
    let lines: Vec<&str> = sdp.lines().collect();

    let removed: Vec<String> = lines
        .iter()
        .filter_map(|line| payload_type_of(line, FILTERED_CODECS))
        .collect();

    if removed.is_empty() {
        return sdp.to_string();
    }

    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for line in lines {
        if references_removed_payload(line, &removed) {
            continue;
        }
        if line.starts_with("m=video") {
            out.push(strip_payloads_from_mline(line, &removed));
        } else {
            out.push(line.to_string());
        }
    }
    out.join("\r\n") + "\r\n"
}

/// If the line maps a payload type to one of `codecs`, return that payload
/// type. Expects the `a=rtpmap:<pt> <codec>/90000` shape.
fn payload_type_of(line: &str, codecs: &[&str]) -> Option<String> {
    let rest = line.strip_prefix("a=rtpmap:")?;
    let (pt, encoding) = rest.split_once(' ')?;
    let codec = encoding.split('/').next()?;
    if codecs.iter().any(|c| codec.eq_ignore_ascii_case(c)) {
        Some(pt.to_string())
    } else {
        None
    }
}

fn references_removed_payload(line: &str, removed: &[String]) -> bool {
    for prefix in ["a=rtpmap:", "a=rtcp-fb:", "a=fmtp:"] {
        if let Some(rest) = line.strip_prefix(prefix) {
            let pt = rest.split([' ', '/']).next().unwrap_or("");
            return removed.iter().any(|r| r == pt);
        }
    }
    false
}

/// Drop removed payload numbers from an `m=video <port> <proto> <pt...>` line.
fn strip_payloads_from_mline(line: &str, removed: &[String]) -> String {
    let mut parts = line.split(' ');
    let mut kept: Vec<&str> = parts.by_ref().take(3).collect();
    kept.extend(parts.filter(|pt| !removed.iter().any(|r| r == pt)));
    kept.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96 98 100 45\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=rtpmap:96 VP8/90000\r\n\
        a=rtcp-fb:96 nack\r\n\
        a=rtcp-fb:96 nack pli\r\n\
        a=fmtp:96 max-fr=30\r\n\
        a=rtpmap:98 VP9/90000\r\n\
        a=rtcp-fb:98 nack\r\n\
        a=rtpmap:100 H264/90000\r\n\
        a=fmtp:100 level-asymmetry-allowed=1;packetization-mode=1\r\n\
        a=rtpmap:45 AV1/90000\r\n\
        a=rtcp-fb:45 nack\r\n\
        a=fmtp:45 level-idx=5\r\n";

    #[test]
    fn vp8_and_av1_are_removed() {
        let filtered = filter_codecs(OFFER);
        assert!(!filtered.contains("VP8"));
        assert!(!filtered.contains("AV1"));
        assert!(!filtered.contains("a=rtpmap:96"));
        assert!(!filtered.contains("a=rtcp-fb:96"));
        assert!(!filtered.contains("a=fmtp:96"));
        assert!(!filtered.contains("a=rtpmap:45"));
        assert!(!filtered.contains("a=fmtp:45"));
    }

    #[test]
    fn surviving_codecs_are_untouched() {
        let filtered = filter_codecs(OFFER);
        assert!(filtered.contains("a=rtpmap:98 VP9/90000"));
        assert!(filtered.contains("a=rtcp-fb:98 nack"));
        assert!(filtered.contains("a=rtpmap:100 H264/90000"));
        assert!(filtered.contains("a=fmtp:100 level-asymmetry-allowed=1;packetization-mode=1"));
    }

    #[test]
    fn mline_payload_list_is_rewritten() {
        let filtered = filter_codecs(OFFER);
        assert!(filtered.contains("m=video 9 UDP/TLS/RTP/SAVPF 98 100"));
    }

    #[test]
    fn non_media_lines_pass_verbatim() {
        let filtered = filter_codecs(OFFER);
        assert!(filtered.contains("o=- 4611731400430051336 2 IN IP4 127.0.0.1"));
        assert!(filtered.contains("c=IN IP4 0.0.0.0"));
    }

    #[test]
    fn output_is_crlf_joined() {
        let filtered = filter_codecs(OFFER);
        assert!(filtered.ends_with("\r\n"));
        assert!(!filtered.contains("\n\n"));
        for line in filtered.split("\r\n") {
            assert!(!line.contains('\n'));
        }
    }

    #[test]
    fn sdp_without_filtered_codecs_is_unchanged() {
        let sdp = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 100\r\na=rtpmap:100 H264/90000\r\n";
        assert_eq!(filter_codecs(sdp), sdp);
    }

    #[test]
    fn payload_prefix_collision_is_not_removed() {
        // Payload 9 must survive even though payload 96 is removed: the
        // match is on the whole payload number, not a prefix.
        let sdp = "m=video 9 UDP/TLS/RTP/SAVPF 96 9\r\n\
            a=rtpmap:96 VP8/90000\r\n\
            a=rtpmap:9 H264/90000\r\n";
        let filtered = filter_codecs(sdp);
        assert!(filtered.contains("a=rtpmap:9 H264/90000"));
        assert!(filtered.contains("m=video 9 UDP/TLS/RTP/SAVPF 9"));
        assert!(!filtered.contains("VP8"));
    }

    #[test]
    fn audio_mlines_are_left_alone() {
        let sdp = "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
            a=rtpmap:111 opus/48000/2\r\n\
            m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
            a=rtpmap:96 VP8/90000\r\n";
        let filtered = filter_codecs(sdp);
        assert!(filtered.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111"));
        assert!(filtered.contains("a=rtpmap:111 opus/48000/2"));
    }
}
