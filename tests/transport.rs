//! End-to-end scenarios over a full [`Transport`]: control-plane
//! requests, RTP routing producer→consumer, RTCP dispatch and the
//! transport-wide feedback loop.

use std::collections::VecDeque;

use serde_json::json;

use sfu_core::channel::{Request, Response};
use sfu_core::rtcp::{Rtcp, RtcpPacket, PacketStatus, ReceptionReport, ReceiverReport, ReportList};
use sfu_core::rtp::Ssrc;
use sfu_core::{RequestError, Transport, TransportListener, TransportOptions};

fn init_log() {
    use std::sync::Once;
    static START: Once = Once::new();

    START.call_once(|| {
        let env_filter = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
            .from_env_lossy();

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    });
}

/// Listener recording everything the transport does.
#[derive(Default)]
struct Router {
    rtp: Vec<Vec<u8>>,
    rtcp: Vec<Vec<u8>>,
    new_producers: Vec<String>,
    closed_producers: Vec<String>,
    new_streams: Vec<(String, Ssrc)>,
    forwarded: Vec<(String, Vec<u8>)>,
    key_frame_requests: Vec<(String, String)>,
    reject_consumers: bool,
}

impl TransportListener for Router {
    fn send_rtp(&mut self, _transport_id: &str, buf: &[u8]) {
        self.rtp.push(buf.to_vec());
    }

    fn send_rtcp(&mut self, _transport_id: &str, buf: &[u8]) {
        self.rtcp.push(buf.to_vec());
    }

    fn on_new_producer(&mut self, _transport_id: &str, producer_id: &str) {
        self.new_producers.push(producer_id.to_string());
    }

    fn on_producer_closed(&mut self, _transport_id: &str, producer_id: &str) {
        self.closed_producers.push(producer_id.to_string());
    }

    fn on_producer_new_rtp_stream(&mut self, _transport_id: &str, producer_id: &str, ssrc: Ssrc) {
        self.new_streams.push((producer_id.to_string(), ssrc));
    }

    fn on_producer_rtp_packet(
        &mut self,
        _transport_id: &str,
        producer_id: &str,
        buf: &[u8],
        _header: &sfu_core::rtp::RtpHeader,
    ) {
        self.forwarded.push((producer_id.to_string(), buf.to_vec()));
    }

    fn on_new_consumer(
        &mut self,
        _transport_id: &str,
        _consumer_id: &str,
        _producer_id: &str,
    ) -> Result<(), RequestError> {
        if self.reject_consumers {
            Err(RequestError::Failed("Producer not found".into()))
        } else {
            Ok(())
        }
    }

    fn on_consumer_key_frame_requested(
        &mut self,
        _transport_id: &str,
        consumer_id: &str,
        producer_id: &str,
    ) {
        self.key_frame_requests
            .push((consumer_id.to_string(), producer_id.to_string()));
    }
}

impl Router {
    fn parsed_rtcp(&self) -> Vec<Rtcp> {
        let mut all = Vec::new();
        for buf in &self.rtcp {
            let mut parsed = VecDeque::new();
            Rtcp::read_packet(buf, &mut parsed);
            all.extend(parsed);
        }
        all
    }
}

fn request(json: serde_json::Value) -> Request {
    serde_json::from_value(json).unwrap()
}

fn accepted(response: &Response) -> &Response {
    assert!(
        matches!(response, Response::Accept { .. }),
        "request was rejected: {response:?}"
    );
    response
}

fn produce_request(producer_id: &str, ssrc: u32) -> Request {
    request(json!({
        "method": "TRANSPORT_PRODUCE",
        "internal": { "transportId": "t1", "producerId": producer_id },
        "data": {
            "kind": "video",
            "rtpParameters": {
                "mid": producer_id,
                "encodings": [{ "ssrc": ssrc }],
                "headerExtensions": [
                    { "uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "id": 4 },
                    { "uri": "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time", "id": 2 },
                    {
                        "uri": "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
                        "id": 3
                    }
                ],
                "rtcp": { "cname": "producer-cname" }
            }
        }
    }))
}

fn consume_request(consumer_id: &str, producer_id: &str, ssrc: u32) -> Request {
    request(json!({
        "method": "TRANSPORT_CONSUME",
        "internal": {
            "transportId": "t1",
            "producerId": producer_id,
            "consumerId": consumer_id
        },
        "data": {
            "kind": "video",
            "rtpParameters": {
                "encodings": [{ "ssrc": ssrc }],
                "rtcp": { "cname": "consumer-cname" }
            }
        }
    }))
}

/// Media packet with abs-send-time (id 2) and transport-wide-cc (id 3)
/// extensions, as negotiated in `produce_request`.
#[rustfmt::skip]
fn media_packet(ssrc: u32, seq: u16, wide_seq: u16) -> Vec<u8> {
    let mut buf = vec![
        0b1001_0000, 96, 0, 0,      // v2, ext, pt 96
        0, 0, 0, 0,                 // timestamp
        0, 0, 0, 0,                 // ssrc
        0xBE, 0xDE, 0, 2,           // one-byte extensions, 2 words
        0x22, 0, 0, 0,              // abs-send-time
        0x31, 0, 0, 0,              // transport-wide-cc + padding
        1, 2, 3, 4,                 // payload
    ];
    buf[2..4].copy_from_slice(&seq.to_be_bytes());
    buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
    buf[21..23].copy_from_slice(&wide_seq.to_be_bytes());
    buf
}

fn transport() -> Transport {
    Transport::new("t1".into(), TransportOptions::default(), 0)
}

#[test]
fn produce_and_route_rtp() {
    init_log();

    let mut router = Router::default();
    let mut transport = transport();

    accepted(&transport.handle_request(&produce_request("p1", 1111), 0, &mut router));
    assert_eq!(router.new_producers, vec!["p1"]);

    transport.receive_rtp_packet(&media_packet(1111, 100, 1), 10, &mut router);

    assert_eq!(router.new_streams, vec![("p1".to_string(), Ssrc::from(1111))]);
    assert_eq!(router.forwarded.len(), 1);
    assert_eq!(router.forwarded[0].0, "p1");
}

#[test]
fn unroutable_rtp_is_dropped() {
    init_log();

    let mut router = Router::default();
    let mut transport = transport();

    transport.receive_rtp_packet(&media_packet(9999, 100, 1), 10, &mut router);

    assert!(router.forwarded.is_empty());
    assert!(router.new_streams.is_empty());
}

#[test]
fn duplicate_producer_id_is_rejected() {
    init_log();

    let mut router = Router::default();
    let mut transport = transport();

    accepted(&transport.handle_request(&produce_request("p1", 1111), 0, &mut router));

    let response = transport.handle_request(&produce_request("p1", 2222), 0, &mut router);
    assert!(matches!(response, Response::Reject { .. }));
}

#[test]
fn ssrc_collision_rolls_back_producer() {
    init_log();

    let mut router = Router::default();
    let mut transport = transport();

    accepted(&transport.handle_request(&produce_request("p1", 1111), 0, &mut router));

    // Same SSRC under a different id: rejected, no listener event.
    let response = transport.handle_request(&produce_request("p2", 1111), 0, &mut router);
    assert!(matches!(response, Response::Reject { .. }));
    assert_eq!(router.new_producers, vec!["p1"]);

    // The id is free again for a clean registration.
    accepted(&transport.handle_request(&produce_request("p2", 2222), 0, &mut router));
}

#[test]
fn rejected_consume_leaves_no_state() {
    init_log();

    let mut router = Router {
        reject_consumers: true,
        ..Default::default()
    };
    let mut transport = transport();

    let response = transport.handle_request(&consume_request("c1", "p-far", 0xAA), 0, &mut router);
    assert!(matches!(response, Response::Reject { .. }));

    // The media SSRC was not claimed: a new consume succeeds.
    router.reject_consumers = false;
    accepted(&transport.handle_request(&consume_request("c1", "p-far", 0xAA), 0, &mut router));
}

#[test]
fn consume_and_forward_rewrites_ssrc() {
    init_log();

    let mut router = Router::default();
    let mut transport = transport();

    accepted(&transport.handle_request(&produce_request("p1", 1111), 0, &mut router));
    accepted(&transport.handle_request(&consume_request("c1", "p1", 0xAA), 0, &mut router));

    transport.receive_rtp_packet(&media_packet(1111, 100, 1), 10, &mut router);

    // The router fans the forwarded packet back into the transport.
    let (producer_id, buf) = router.forwarded.pop().unwrap();
    transport.forward_producer_rtp(&producer_id, &buf, 10, &mut router);

    assert_eq!(router.rtp.len(), 1);
    let sent = &router.rtp[0];
    let out_ssrc = u32::from_be_bytes([sent[8], sent[9], sent[10], sent[11]]);
    assert_eq!(out_ssrc, 0xAA);
}

#[test]
fn receiver_report_routes_to_consumer() {
    init_log();

    let mut router = Router::default();
    let mut transport = transport();

    accepted(&transport.handle_request(&produce_request("p1", 1111), 0, &mut router));
    accepted(&transport.handle_request(&consume_request("c1", "p1", 0xAA), 0, &mut router));

    // One RR with a report for our consumer and one for a stranger.
    let mut reports = ReportList::new();
    for (ssrc, fraction_lost) in [(0xAA_u32, 64_u8), (0xBB, 128)] {
        let report = ReceptionReport {
            ssrc: ssrc.into(),
            fraction_lost,
            packets_lost: 0,
            max_seq: 100,
            jitter: 0,
            last_sr_time: 0,
            last_sr_delay: 0,
        };
        reports.push(report);
    }

    let rr = ReceiverReport {
        sender_ssrc: 0.into(),
        reports,
    };
    let mut buf = vec![0; 256];
    let n = rr.write_to(&mut buf);
    buf.truncate(n);

    transport.receive_rtcp_packet(&buf, 100, &mut router);

    // The consumer for 0xAA took the report; 0xBB was logged and dropped.
    let response = transport.handle_request(
        &request(json!({
            "method": "CONSUMER_GET_STATS",
            "internal": { "transportId": "t1", "consumerId": "c1" }
        })),
        200,
        &mut router,
    );

    let Response::Accept { data: Some(data), .. } = response else {
        panic!("stats rejected");
    };
    assert_eq!(data["fractionLost"], 64);
}

#[test]
fn pli_feedback_requests_key_frame_from_producer() {
    init_log();

    let mut router = Router::default();
    let mut transport = transport();

    accepted(&transport.handle_request(&produce_request("p1", 1111), 0, &mut router));
    accepted(&transport.handle_request(&consume_request("c1", "p1", 0xAA), 0, &mut router));

    // PLI for the consumer's SSRC.
    let pli = Rtcp::Pli(sfu_core::rtcp::Pli {
        sender_ssrc: 0.into(),
        ssrc: 0xAA.into(),
    });
    let mut buf = vec![0; 64];
    let n = pli.write_to(&mut buf);
    buf.truncate(n);

    transport.receive_rtcp_packet(&buf, 100, &mut router);
    assert_eq!(
        router.key_frame_requests,
        vec![("c1".to_string(), "p1".to_string())]
    );

    // The router relays to the producing transport (here: the same),
    // which emits a PLI towards the publishing endpoint.
    transport.receive_rtp_packet(&media_packet(1111, 100, 1), 100, &mut router);
    router.rtcp.clear();
    transport.request_producer_key_frame("p1", 100, &mut router);

    let packets = router.parsed_rtcp();
    assert!(matches!(
        packets.as_slice(),
        [Rtcp::Pli(pli)] if *pli.ssrc == 1111
    ));
}

#[test]
fn tcc_server_emits_feedback_on_timer() {
    init_log();

    let mut router = Router::default();
    let mut transport = transport();

    accepted(&transport.handle_request(&produce_request("p1", 1111), 0, &mut router));
    transport.connected(0, &mut router);

    // Three packets tagged with wide sequence numbers.
    transport.receive_rtp_packet(&media_packet(1111, 100, 50), 10, &mut router);
    transport.receive_rtp_packet(&media_packet(1111, 101, 51), 15, &mut router);
    transport.receive_rtp_packet(&media_packet(1111, 102, 52), 20, &mut router);

    // Drive the feedback timer.
    let deadline = transport.poll_timeout().expect("feedback timer armed");
    transport.handle_timeout(deadline, &mut router);

    let twcc = router
        .parsed_rtcp()
        .into_iter()
        .find_map(|p| match p {
            Rtcp::Twcc(v) => Some(v),
            _ => None,
        })
        .expect("transport-wide feedback emitted");

    assert_eq!(twcc.base_seq, 51);
    assert_eq!(twcc.status_count, 2);
    let statuses: Vec<_> = twcc.iter().map(|(_, s, _)| s).collect();
    assert_eq!(
        statuses,
        vec![
            PacketStatus::ReceivedSmallDelta,
            PacketStatus::ReceivedSmallDelta
        ]
    );
}

#[test]
fn rtcp_scheduler_sends_receiver_reports() {
    init_log();

    let mut router = Router::default();
    let mut transport = transport();

    accepted(&transport.handle_request(&produce_request("p1", 1111), 0, &mut router));
    transport.connected(0, &mut router);

    for i in 0..10_u16 {
        transport.receive_rtp_packet(
            &media_packet(1111, 100 + i, 50 + i),
            10 + i as u64 * 20,
            &mut router,
        );
    }

    // Run timers well past the RTCP interval.
    let mut now = 0;
    while now < 3000 {
        let Some(deadline) = transport.poll_timeout() else {
            break;
        };
        now = deadline.max(now + 1);
        transport.handle_timeout(now, &mut router);
    }

    let has_rr = router
        .parsed_rtcp()
        .iter()
        .any(|p| matches!(p, Rtcp::ReceiverReport(rr) if rr.reports.len() == 1));
    assert!(has_rr, "compound with a receiver report was sent");
}

#[test]
fn close_notifies_all_entities() {
    init_log();

    let mut router = Router::default();
    let mut transport = transport();

    accepted(&transport.handle_request(&produce_request("p1", 1111), 0, &mut router));
    accepted(&transport.handle_request(&consume_request("c1", "p1", 0xAA), 0, &mut router));

    transport.close(&mut router);

    assert_eq!(router.closed_producers, vec!["p1"]);
}

#[test]
fn max_incoming_bitrate_is_clamped() {
    init_log();

    let mut router = Router::default();
    let mut transport = transport();

    let response = transport.handle_request(
        &request(json!({
            "method": "TRANSPORT_SET_MAX_INCOMING_BITRATE",
            "internal": { "transportId": "t1" },
            "data": { "bitrate": 1 }
        })),
        0,
        &mut router,
    );
    accepted(&response);
}
