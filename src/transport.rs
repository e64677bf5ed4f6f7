use std::collections::{HashMap, VecDeque};

use rand::Rng;

use crate::bwe::{BweController, PacketSendInfo};
use crate::channel::{
    ConsumeData, Method, PreferredLayers, ProduceData, Request, RequestError, Response,
    SetMaxIncomingBitrateData,
};
use crate::consumer::Consumer;
use crate::listener::{RtpListener, SctpListener};
use crate::producer::Producer;
use crate::rate::RateCalculator;
use crate::remb::{RembClient, RembClientEvent, RembServerState};
use crate::rtcp::{CompoundPacket, Rtcp, RtcpPacket, MAX_VIDEO_INTERVAL_MS};
use crate::rtp::{RtpHeader, RtpPacket, Ssrc};
use crate::time::{TimerHandle, TimerQueue};
use crate::twcc_client::{TwccClient, TwccClientListener};
use crate::twcc_server::TwccServer;
use crate::MAX_RTCP_PACKET_LEN;

/// Events and wire primitives from a transport towards its owner.
///
/// The owner (the router in a full worker) implements this once; every
/// method that can produce events takes it as a parameter, so there are
/// no stored back-references in either direction.
#[allow(unused_variables)]
pub trait TransportListener {
    /// Hand a serialized RTP packet to the concrete wire (UDP/DTLS/...).
    fn send_rtp(&mut self, transport_id: &str, buf: &[u8]);

    /// Hand a serialized RTCP packet to the concrete wire.
    fn send_rtcp(&mut self, transport_id: &str, buf: &[u8]);

    fn on_new_producer(&mut self, transport_id: &str, producer_id: &str) {}

    fn on_producer_closed(&mut self, transport_id: &str, producer_id: &str) {}

    fn on_producer_paused(&mut self, transport_id: &str, producer_id: &str) {}

    fn on_producer_resumed(&mut self, transport_id: &str, producer_id: &str) {}

    fn on_producer_new_rtp_stream(&mut self, transport_id: &str, producer_id: &str, ssrc: Ssrc) {}

    fn on_producer_rtp_stream_score(
        &mut self,
        transport_id: &str,
        producer_id: &str,
        ssrc: Ssrc,
        score: u8,
        previous_score: u8,
    ) {
    }

    fn on_producer_rtcp_sender_report(
        &mut self,
        transport_id: &str,
        producer_id: &str,
        ssrc: Ssrc,
        first: bool,
    ) {
    }

    /// A producer accepted an RTP packet that should reach its
    /// consumers. The router fans this out by calling
    /// [`Transport::forward_producer_rtp`] on every transport hosting a
    /// consumer of this producer.
    fn on_producer_rtp_packet(
        &mut self,
        transport_id: &str,
        producer_id: &str,
        buf: &[u8],
        header: &RtpHeader,
    ) {
    }

    /// Worst fraction lost reported by any remote consumer of this
    /// producer, for receiver report generation.
    fn worst_remote_fraction_lost(&mut self, transport_id: &str, producer_id: &str) -> u8 {
        0
    }

    /// A consumer is being created for `producer_id`. Failing here
    /// rejects the TRANSPORT_CONSUME request and rolls the consumer back.
    fn on_new_consumer(
        &mut self,
        transport_id: &str,
        consumer_id: &str,
        producer_id: &str,
    ) -> Result<(), RequestError> {
        Ok(())
    }

    fn on_consumer_closed(&mut self, transport_id: &str, consumer_id: &str) {}

    fn on_consumer_producer_closed(&mut self, transport_id: &str, consumer_id: &str) {}

    /// A consumer needs a key frame from its producer. The router calls
    /// [`Transport::request_producer_key_frame`] on the transport that
    /// hosts the producer.
    fn on_consumer_key_frame_requested(
        &mut self,
        transport_id: &str,
        consumer_id: &str,
        producer_id: &str,
    ) {
    }

    fn on_sctp_message(
        &mut self,
        transport_id: &str,
        data_producer_id: &str,
        ppid: u32,
        payload: &[u8],
    ) {
    }
}

/// Tunables for a transport.
pub struct TransportOptions {
    /// Seed for the outgoing bandwidth estimation.
    pub initial_available_outgoing_bitrate: u32,
    /// Emit transport-wide feedback for inbound packets.
    pub enable_tcc_server: bool,
    /// Send-side bandwidth estimation; the controller drives the pacer.
    pub bwe_controller: Option<Box<dyn BweController>>,
    /// Legacy REMB-based estimation for the send direction.
    pub enable_remb_client: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            initial_available_outgoing_bitrate: 600_000,
            enable_tcc_server: true,
            bwe_controller: None,
            enable_remb_client: false,
        }
    }
}

/// The routing engine: owns producers and consumers, demultiplexes
/// inbound RTP/RTCP, forwards media, runs congestion control in both
/// directions and schedules compound RTCP.
pub struct Transport {
    id: String,
    producers: HashMap<String, Producer>,
    consumers: HashMap<String, Consumer>,
    ssrc_consumer: HashMap<Ssrc, String>,
    rtp_listener: RtpListener,
    sctp_listener: SctpListener,
    ext_ids: crate::rtp::ExtensionIds,
    timers: TimerQueue,
    rtcp_timer: Option<TimerHandle>,
    tcc_server: Option<TwccServer>,
    tcc_client: Option<TwccClient>,
    remb_client: Option<RembClient>,
    remb_server: RembServerState,
    recv_transmission: RateCalculator,
    send_transmission: RateCalculator,
    available_outgoing_bitrate: u32,
    next_wide_seq: u16,
    connected: bool,
}

impl Transport {
    pub fn new(id: String, options: TransportOptions, now_ms: u64) -> Self {
        let mut timers = TimerQueue::new();

        let tcc_server = options
            .enable_tcc_server
            .then(|| TwccServer::new(MAX_RTCP_PACKET_LEN));

        let tcc_client = options.bwe_controller.map(|controller| {
            TwccClient::new(
                controller,
                options.initial_available_outgoing_bitrate,
                &mut timers,
                now_ms,
            )
        });

        let remb_client = options
            .enable_remb_client
            .then(|| RembClient::new(options.initial_available_outgoing_bitrate, now_ms));

        Transport {
            id,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            ssrc_consumer: HashMap::new(),
            rtp_listener: RtpListener::new(),
            sctp_listener: SctpListener::new(),
            ext_ids: Default::default(),
            timers,
            rtcp_timer: None,
            tcc_server,
            tcc_client,
            remb_client,
            remb_server: RembServerState::new(),
            recv_transmission: RateCalculator::default(),
            send_transmission: RateCalculator::default(),
            available_outgoing_bitrate: options.initial_available_outgoing_bitrate,
            next_wide_seq: 0,
            connected: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The latest estimate for the outgoing direction.
    pub fn available_outgoing_bitrate(&self) -> u32 {
        self.available_outgoing_bitrate
    }

    /// Underlying connection established. Starts the RTCP scheduler and
    /// asks consumers to bootstrap with key frames.
    pub fn connected(&mut self, now_ms: u64, listener: &mut dyn TransportListener) {
        self.connected = true;

        let at = now_ms + MAX_VIDEO_INTERVAL_MS / 2;
        match self.rtcp_timer {
            Some(timer) => self.timers.restart(timer, at),
            None => self.rtcp_timer = Some(self.timers.schedule(at)),
        }

        if let Some(tcc_server) = &mut self.tcc_server {
            tcc_server.transport_connected(&mut self.timers, now_ms);
        }
        if let Some(tcc_client) = &mut self.tcc_client {
            tcc_client.transport_connected();
        }

        let needs_key_frame: Vec<(String, String)> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.transport_connected())
            .map(|(id, c)| (id.clone(), c.producer_id().to_string()))
            .collect();

        for (consumer_id, producer_id) in needs_key_frame {
            listener.on_consumer_key_frame_requested(&self.id, &consumer_id, &producer_id);
        }
    }

    /// Underlying connection lost. Stops the periodic machinery.
    pub fn disconnected(&mut self) {
        self.connected = false;

        if let Some(timer) = self.rtcp_timer.take() {
            self.timers.stop(timer);
        }
        if let Some(tcc_server) = &mut self.tcc_server {
            tcc_server.transport_disconnected(&mut self.timers);
        }
        if let Some(tcc_client) = &mut self.tcc_client {
            tcc_client.transport_disconnected();
        }
    }

    /// Close the transport, notifying the listener about every producer
    /// and consumer going away. Dropping without calling this tears the
    /// state down silently.
    pub fn close(&mut self, listener: &mut dyn TransportListener) {
        self.disconnected();

        for (id, _) in self.producers.drain() {
            listener.on_producer_closed(&self.id, &id);
        }
        for (id, _) in self.consumers.drain() {
            listener.on_consumer_closed(&self.id, &id);
        }
        self.ssrc_consumer.clear();
    }

    /// Earliest pending timer deadline.
    pub fn poll_timeout(&self) -> Option<u64> {
        self.timers.poll_timeout()
    }

    /// Drive time forward; dispatches every due timer.
    pub fn handle_timeout(&mut self, now_ms: u64, listener: &mut dyn TransportListener) {
        let fired = self.timers.handle_timeout(now_ms);

        for handle in fired {
            if self.rtcp_timer == Some(handle) {
                self.on_rtcp_timer(now_ms, listener);
                continue;
            }

            if self
                .tcc_server
                .as_ref()
                .is_some_and(|s| s.is_timer(handle))
            {
                let tcc_server = self.tcc_server.as_mut().expect("tcc server");
                tcc_server.on_timer();
                self.drain_tcc_server(listener);
                continue;
            }

            if self
                .tcc_client
                .as_ref()
                .is_some_and(|c| c.is_pacer_timer(handle))
            {
                self.with_tcc_client(now_ms, listener, |client, timers, hooks, now| {
                    client.on_pacer_timer(timers, now, hooks);
                });
                continue;
            }

            // Key frame retry timers live in the producers.
            let mut rtcp = Vec::new();
            for producer in self.producers.values_mut() {
                if let Some(packet) = producer.on_timer(handle) {
                    rtcp.push(packet);
                }
            }
            for packet in rtcp {
                self.send_rtcp_packet(packet, listener);
            }
        }
    }

    /// Feed one inbound RTP datagram.
    pub fn receive_rtp_packet(
        &mut self,
        buf: &[u8],
        now_ms: u64,
        listener: &mut dyn TransportListener,
    ) {
        self.recv_transmission.update(buf.len(), now_ms);

        let Some(header) = RtpHeader::parse(buf, &self.ext_ids) else {
            warn!("received data is not a valid RTP packet");
            return;
        };

        // Feed the transport-wide feedback machinery first; it covers
        // every tagged packet whether routable or not.
        if let Some(wide_seq) = header.ext_vals.transport_cc {
            if let Some(tcc_server) = &mut self.tcc_server {
                tcc_server.incoming_packet(now_ms, wide_seq);
            }
            self.drain_tcc_server(listener);
        }

        let Some(producer_id) = self.rtp_listener.get_producer(&header) else {
            warn!(
                "no suitable Producer for received RTP packet [ssrc:{}]",
                header.ssrc
            );
            return;
        };

        let producer = self
            .producers
            .get_mut(&producer_id)
            .expect("listener table in sync with producers");

        let result = producer.receive_rtp_packet(&header, buf.len(), now_ms);

        if !result.accepted {
            warn!(
                "producer {} rejected RTP packet [ssrc:{}]",
                producer_id, header.ssrc
            );
            return;
        }

        if let Some(ssrc) = result.new_stream {
            listener.on_producer_new_rtp_stream(&self.id, &producer_id, ssrc);
        }
        if let Some((ssrc, score, previous)) = result.score_change {
            listener.on_producer_rtp_stream_score(&self.id, &producer_id, ssrc, score, previous);
        }
        if let Some(nack) = result.nack {
            self.send_rtcp_packet(Rtcp::Nack(nack), listener);
        }

        if result.forward {
            listener.on_producer_rtp_packet(&self.id, &producer_id, buf, &header);
        }
    }

    /// Forward a producer packet to every local consumer bound to it.
    /// Called by the router when fanning out
    /// [`TransportListener::on_producer_rtp_packet`].
    pub fn forward_producer_rtp(
        &mut self,
        producer_id: &str,
        buf: &[u8],
        now_ms: u64,
        listener: &mut dyn TransportListener,
    ) {
        let consumer_ids: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.producer_id() == producer_id)
            .map(|(id, _)| id.clone())
            .collect();

        for consumer_id in consumer_ids {
            let consumer = self.consumers.get_mut(&consumer_id).expect("consumer");
            if let Some(packet) = consumer.send_rtp_packet(buf, &self.ext_ids, now_ms) {
                self.send_rtp_packet(packet, now_ms, listener);
            }
        }
    }

    /// Feed one inbound RTCP compound datagram.
    pub fn receive_rtcp_packet(
        &mut self,
        buf: &[u8],
        now_ms: u64,
        listener: &mut dyn TransportListener,
    ) {
        let mut packets = VecDeque::new();
        Rtcp::read_packet(buf, &mut packets);

        for packet in packets {
            self.handle_rtcp(packet, now_ms, listener);
        }
    }

    fn handle_rtcp(&mut self, packet: Rtcp, now_ms: u64, listener: &mut dyn TransportListener) {
        match packet {
            Rtcp::SenderReport(sr) => {
                let ssrc = sr.sender_info.ssrc;
                let Some(producer_id) = self.rtp_listener.get_producer_by_ssrc(ssrc) else {
                    warn!("no Producer found for received Sender Report [ssrc:{}]", ssrc);
                    return;
                };
                let producer = self.producers.get_mut(&producer_id).expect("producer");

                if let Some(first) = producer.receive_rtcp_sender_report(&sr.sender_info, now_ms) {
                    listener.on_producer_rtcp_sender_report(&self.id, &producer_id, ssrc, first);
                }
            }

            Rtcp::ReceiverReport(rr) => {
                for report in rr.reports.iter() {
                    let Some(consumer_id) = self.ssrc_consumer.get(&report.ssrc).cloned() else {
                        warn!(
                            "no Consumer found for received Receiver Report [ssrc:{}]",
                            report.ssrc
                        );
                        continue;
                    };

                    let consumer = self.consumers.get_mut(&consumer_id).expect("consumer");
                    let rtt = consumer.receive_rtcp_receiver_report(report, now_ms);

                    if self.tcc_client.is_some() {
                        let report = *report;
                        let rtt = rtt.unwrap_or(0.0);
                        self.with_tcc_client(now_ms, listener, |client, _, hooks, now| {
                            client.receive_rtcp_receiver_report(&report, rtt, now, hooks);
                        });
                    }
                }
            }

            Rtcp::SourceDescription(sdes) => {
                for chunk in &sdes.chunks {
                    if self.rtp_listener.get_producer_by_ssrc(chunk.ssrc).is_none() {
                        trace!("no Producer for received SDES chunk [ssrc:{}]", chunk.ssrc);
                    }
                }
            }

            Rtcp::Goodbye(bye) => {
                debug!("ignoring received RTCP BYE {:?}", bye.reports);
            }

            Rtcp::Pli(pli) => self.on_key_frame_feedback("PLI", pli.ssrc, listener),
            Rtcp::Fir(fir) => {
                for ssrc in fir.ssrcs().collect::<Vec<_>>() {
                    self.on_key_frame_feedback("FIR", ssrc, listener);
                }
            }

            Rtcp::Remb(remb) => {
                let bitrate = remb.bitrate.min(u32::MAX as u64) as u32;

                if self.tcc_client.is_some() {
                    self.with_tcc_client(now_ms, listener, |client, _, hooks, now| {
                        client.receive_estimated_bitrate(bitrate, now, hooks);
                    });
                } else if self.remb_client.is_some() {
                    let event = self
                        .remb_client
                        .as_mut()
                        .expect("remb client")
                        .receive_remb_feedback(bitrate, now_ms);
                    if let Some(event) = event {
                        self.on_remb_event(event);
                    }
                } else {
                    self.available_outgoing_bitrate = bitrate;
                }
            }

            Rtcp::Nack(nack) => {
                let Some(consumer_id) = self.ssrc_consumer.get(&nack.ssrc).cloned() else {
                    warn!(
                        "no Consumer found for received NACK Feedback [media ssrc:{}]",
                        nack.ssrc
                    );
                    return;
                };

                let consumer = self.consumers.get_mut(&consumer_id).expect("consumer");
                let packets = consumer.receive_nack(&nack);

                for packet in packets {
                    self.send_rtp_packet(packet, now_ms, listener);
                }
            }

            Rtcp::Twcc(twcc) => {
                if self.tcc_client.is_some() {
                    self.with_tcc_client(now_ms, listener, |client, _, hooks, now| {
                        client.receive_rtcp_transport_feedback(&twcc, now, hooks);
                    });
                } else {
                    trace!("ignoring transport feedback, no TCC client");
                }
            }
        }
    }

    fn on_key_frame_feedback(
        &mut self,
        kind: &str,
        media_ssrc: Ssrc,
        listener: &mut dyn TransportListener,
    ) {
        let Some(consumer_id) = self.ssrc_consumer.get(&media_ssrc).cloned() else {
            warn!(
                "no Consumer found for received {} Feedback [media ssrc:{}]",
                kind, media_ssrc
            );
            return;
        };

        let producer_id = self
            .consumers
            .get(&consumer_id)
            .expect("consumer")
            .producer_id()
            .to_string();

        debug!(
            "{} received, requesting key frame for Consumer [media ssrc:{}]",
            kind, media_ssrc
        );

        listener.on_consumer_key_frame_requested(&self.id, &consumer_id, &producer_id);
    }

    /// Router callback: a consumer somewhere needs a key frame from one
    /// of our producers.
    pub fn request_producer_key_frame(
        &mut self,
        producer_id: &str,
        now_ms: u64,
        listener: &mut dyn TransportListener,
    ) {
        let Some(producer) = self.producers.get_mut(producer_id) else {
            warn!("request_producer_key_frame for unknown producer {}", producer_id);
            return;
        };

        let packets = producer.request_key_frame(&mut self.timers, now_ms);
        for packet in packets {
            self.send_rtcp_packet(packet, listener);
        }
    }

    /// Inbound SCTP message, demultiplexed by stream id.
    pub fn receive_sctp_message(
        &mut self,
        stream_id: u16,
        ppid: u32,
        payload: &[u8],
        listener: &mut dyn TransportListener,
    ) {
        let Some(data_producer_id) = self.sctp_listener.get_data_producer(stream_id) else {
            warn!("no DataProducer for SCTP message [stream id:{}]", stream_id);
            return;
        };

        listener.on_sctp_message(&self.id, data_producer_id, ppid, payload);
    }

    /// Send one outbound RTP packet: stamp bandwidth-estimation
    /// extensions, account it, and hand it to the wire.
    fn send_rtp_packet(
        &mut self,
        mut packet: RtpPacket,
        now_ms: u64,
        listener: &mut dyn TransportListener,
    ) {
        if self.tcc_client.is_some() {
            let wide_seq = self.next_wide_seq;

            if packet.set_transport_wide_cc01(wide_seq) {
                self.next_wide_seq = self.next_wide_seq.wrapping_add(1);
                packet.set_abs_send_time(now_ms);

                let info = PacketSendInfo {
                    ssrc: packet.ssrc(),
                    wide_seq,
                    rtp_seq: packet.sequence_number(),
                    length: packet.len(),
                    pacing_info: self
                        .tcc_client
                        .as_mut()
                        .expect("tcc client")
                        .pacing_info(),
                };

                let client = self.tcc_client.as_mut().expect("tcc client");
                client.insert_packet(info.length);
                client.packet_sent(&info, now_ms);
            }
        }

        if let Some(remb_client) = &mut self.remb_client {
            remb_client.receive_rtp_packet(packet.len(), now_ms);
        }

        self.send_transmission.update(packet.len(), now_ms);
        listener.send_rtp(&self.id, packet.as_bytes());
    }

    fn send_rtcp_packet(&mut self, packet: Rtcp, listener: &mut dyn TransportListener) {
        let mut buf = vec![0_u8; MAX_RTCP_PACKET_LEN];
        let len = packet.length_words() * 4;
        if len > buf.len() {
            warn!("cannot send RTCP packet, size too big ({} bytes)", len);
            return;
        }
        let n = packet.write_to(&mut buf);
        buf.truncate(n);
        listener.send_rtcp(&self.id, &buf);
    }

    fn drain_tcc_server(&mut self, listener: &mut dyn TransportListener) {
        loop {
            let Some(twcc) = self.tcc_server.as_mut().and_then(|s| s.poll_packet()) else {
                break;
            };
            self.send_rtcp_packet(Rtcp::Twcc(twcc), listener);
        }
    }

    fn on_remb_event(&mut self, event: RembClientEvent) {
        match event {
            RembClientEvent::RemainingBitrate(remaining) => {
                trace!("REMB remaining bitrate: {}", remaining);
                self.available_outgoing_bitrate =
                    self.available_outgoing_bitrate.max(remaining);
            }
            RembClientEvent::ExceedingBitrate(exceeding) => {
                debug!("REMB exceeding bitrate: {}", exceeding);
                self.available_outgoing_bitrate =
                    self.available_outgoing_bitrate.saturating_sub(exceeding);
            }
        }
    }

    /// The compound RTCP round: consumers contribute sender reports
    /// (flushed one compound per reporting consumer), then producers
    /// stack receiver reports into a final compound.
    fn send_rtcp(&mut self, now_ms: u64, listener: &mut dyn TransportListener) {
        let mut packet = CompoundPacket::new();

        let consumer_ids: Vec<String> = self.consumers.keys().cloned().collect();
        for consumer_id in consumer_ids {
            let consumer = self.consumers.get_mut(&consumer_id).expect("consumer");
            consumer.get_rtcp(&mut packet, now_ms);

            if packet.has_sender_report() {
                if packet.size() > MAX_RTCP_PACKET_LEN {
                    warn!(
                        "cannot send RTCP packet, size too big ({} bytes)",
                        packet.size()
                    );
                    return;
                }

                self.send_rtcp_compound(&packet, listener);
                packet = CompoundPacket::new();
            }
        }

        let producer_ids: Vec<String> = self.producers.keys().cloned().collect();
        let mut score_changes = Vec::new();
        for producer_id in producer_ids {
            let worst = listener.worst_remote_fraction_lost(&self.id, &producer_id);
            let producer = self.producers.get_mut(&producer_id).expect("producer");
            for change in producer.get_rtcp(&mut packet, worst, now_ms) {
                score_changes.push((producer_id.clone(), change));
            }
        }

        for (producer_id, (ssrc, score, previous)) in score_changes {
            listener.on_producer_rtp_stream_score(&self.id, &producer_id, ssrc, score, previous);
        }

        if packet.receiver_report_count() != 0 {
            if packet.size() > MAX_RTCP_PACKET_LEN {
                warn!(
                    "cannot send RTCP packet, size too big ({} bytes)",
                    packet.size()
                );
                return;
            }

            self.send_rtcp_compound(&packet, listener);
        }
    }

    fn send_rtcp_compound(&mut self, packet: &CompoundPacket, listener: &mut dyn TransportListener) {
        let mut buf = vec![0_u8; MAX_RTCP_PACKET_LEN];
        let n = packet.serialize(&mut buf);
        buf.truncate(n);
        listener.send_rtcp(&self.id, &buf);
    }

    fn on_rtcp_timer(&mut self, now_ms: u64, listener: &mut dyn TransportListener) {
        self.send_rtcp(now_ms, listener);

        // Recalculate the next RTCP interval from the sending rate.
        let mut interval = MAX_VIDEO_INTERVAL_MS;

        if !self.consumers.is_empty() {
            let mut rate_kbps: u64 = 0;
            for consumer in self.consumers.values_mut() {
                rate_kbps += consumer.transmission_rate(now_ms) as u64 / 1000;
            }

            if rate_kbps != 0 {
                interval = (360_000 / rate_kbps).min(MAX_VIDEO_INTERVAL_MS);
            }
        }

        // Vary the interval in [0.5, 1.5] to desynchronise with peers.
        let factor = rand::thread_rng().gen_range(5..=15) as f64 / 10.0;
        let interval = (interval as f64 * factor) as u64;

        let at = now_ms + interval.max(1);
        match self.rtcp_timer {
            Some(timer) => self.timers.restart(timer, at),
            None => self.rtcp_timer = Some(self.timers.schedule(at)),
        }
    }

    /// Run a closure over the TCC client with the transport-side hooks
    /// in place, then apply whatever the hooks collected.
    fn with_tcc_client(
        &mut self,
        now_ms: u64,
        listener: &mut dyn TransportListener,
        f: impl FnOnce(&mut TwccClient, &mut TimerQueue, &mut dyn TwccClientListener, u64),
    ) {
        let Some(mut client) = self.tcc_client.take() else {
            return;
        };

        let mut hooks = ClientHooks {
            transport_id: &self.id,
            now_ms,
            next_wide_seq: &mut self.next_wide_seq,
            send_transmission: &mut self.send_transmission,
            listener,
            sent: Vec::new(),
            bitrate_events: Vec::new(),
        };

        f(&mut client, &mut self.timers, &mut hooks, now_ms);

        let sent = std::mem::take(&mut hooks.sent);
        let bitrate_events = std::mem::take(&mut hooks.bitrate_events);

        for info in &sent {
            client.packet_sent(info, now_ms);
        }

        self.tcc_client = Some(client);

        for (available, previous) in bitrate_events {
            debug!(
                "available outgoing bitrate changed [now:{}, before:{}]",
                available, previous
            );
            self.available_outgoing_bitrate = available;
        }
    }

    /// Handle one control-channel request addressed at this transport or
    /// one of its producers/consumers.
    pub fn handle_request(
        &mut self,
        request: &Request,
        now_ms: u64,
        listener: &mut dyn TransportListener,
    ) -> Response {
        match self.try_handle_request(request, now_ms, listener) {
            Ok(response) => response,
            Err(e) => Response::reject(e),
        }
    }

    fn try_handle_request(
        &mut self,
        request: &Request,
        now_ms: u64,
        listener: &mut dyn TransportListener,
    ) -> Result<Response, RequestError> {
        match request.method {
            Method::TransportSetMaxIncomingBitrate => {
                const MIN_BITRATE: u32 = 10_000;

                let data: SetMaxIncomingBitrateData = parse_data(&request.data)?;
                let bitrate = data.bitrate.max(MIN_BITRATE);

                self.remb_server.set_max_incoming_bitrate(bitrate);

                debug!("Transport maximum incoming bitrate set to {}bps", bitrate);

                Ok(Response::accept())
            }

            Method::TransportProduce => {
                let producer_id = new_entity_id(request.internal.producer_id.as_deref())?;
                if self.producers.contains_key(&producer_id) {
                    return Err(RequestError::Failed(
                        "a Producer with same producerId already exists".into(),
                    ));
                }

                let data: ProduceData = parse_data(&request.data)?;
                let producer = Producer::new(producer_id.clone(), data)?;

                // This may fail on SSRC/MID/RID collision; the producer
                // is dropped and nothing sticks.
                self.rtp_listener.add_producer(&producer)?;

                // Bandwidth related extension ids are shared transport
                // wide; first producer wins.
                self.ext_ids.merge_from(producer.rtp_header_extension_ids());

                let type_str = producer.type_str();
                self.producers.insert(producer_id.clone(), producer);

                listener.on_new_producer(&self.id, &producer_id);

                debug!("Producer created [producerId:{}]", producer_id);

                Ok(Response::accept_data(
                    serde_json::json!({ "type": type_str }),
                ))
            }

            Method::TransportConsume => {
                let producer_id = request
                    .internal
                    .producer_id
                    .clone()
                    .ok_or_else(|| RequestError::Failed("request has no internal.producerId".into()))?;
                let consumer_id = new_entity_id(request.internal.consumer_id.as_deref())?;
                if self.consumers.contains_key(&consumer_id) {
                    return Err(RequestError::Failed(
                        "a Consumer with same consumerId already exists".into(),
                    ));
                }

                let data: ConsumeData = parse_data(&request.data)?;
                let consumer = Consumer::new(consumer_id.clone(), producer_id.clone(), data)?;

                // The listener verifies the producer exists; failure
                // rolls the consumer back before any map was touched.
                listener.on_new_consumer(&self.id, &consumer_id, &producer_id)?;

                self.ssrc_consumer
                    .insert(consumer.media_ssrc(), consumer_id.clone());

                let response = serde_json::json!({
                    "paused": consumer.is_paused(),
                    "producerPaused": consumer.is_producer_paused(),
                    "score": consumer.score(),
                });

                self.consumers.insert(consumer_id.clone(), consumer);

                debug!(
                    "Consumer created [consumerId:{}, producerId:{}]",
                    consumer_id, producer_id
                );

                Ok(Response::accept_data(response))
            }

            Method::TransportDump => Ok(Response::accept_data(serde_json::json!({
                "id": self.id,
                "producerIds": self.producers.keys().collect::<Vec<_>>(),
                "consumerIds": self.consumers.keys().collect::<Vec<_>>(),
            }))),

            Method::TransportGetStats => {
                let recv = self.recv_transmission.get_rate(now_ms);
                let send = self.send_transmission.get_rate(now_ms);
                Ok(Response::accept_data(serde_json::json!({
                    "recvBitrate": recv,
                    "sendBitrate": send,
                    "availableOutgoingBitrate": self.available_outgoing_bitrate,
                })))
            }

            Method::ProducerClose => {
                let producer_id = self.producer_from_request(request)?.id().to_string();

                self.rtp_listener.remove_producer(&producer_id);
                self.producers.remove(&producer_id);

                listener.on_producer_closed(&self.id, &producer_id);

                debug!("Producer closed [id:{}]", producer_id);

                Ok(Response::accept())
            }

            Method::ProducerDump => {
                let producer = self.producer_from_request(request)?;
                Ok(Response::accept_data(serde_json::to_value(producer.dump())?))
            }

            Method::ProducerGetStats => {
                let producer = self.producer_from_request_mut(request)?;
                let stats = producer.get_stats(now_ms);
                Ok(Response::accept_data(serde_json::to_value(stats)?))
            }

            Method::ProducerPause => {
                let id = self.id.clone();
                let producer = self.producer_from_request_mut(request)?;
                producer.pause();
                let producer_id = producer.id().to_string();
                listener.on_producer_paused(&id, &producer_id);
                Ok(Response::accept())
            }

            Method::ProducerResume => {
                let id = self.id.clone();
                let producer = self.producer_from_request_mut(request)?;
                producer.resume();
                let producer_id = producer.id().to_string();
                listener.on_producer_resumed(&id, &producer_id);
                Ok(Response::accept())
            }

            Method::ProducerRequestKeyFrame => {
                let producer_id = self.producer_from_request(request)?.id().to_string();
                self.request_producer_key_frame(&producer_id, now_ms, listener);
                Ok(Response::accept())
            }

            Method::ConsumerClose => {
                let consumer_id = self.consumer_from_request(request)?.id().to_string();
                self.remove_consumer(&consumer_id);

                listener.on_consumer_closed(&self.id, &consumer_id);

                debug!("Consumer closed [id:{}]", consumer_id);

                Ok(Response::accept())
            }

            Method::ConsumerDump => {
                let consumer = self.consumer_from_request(request)?;
                Ok(Response::accept_data(serde_json::to_value(consumer.dump())?))
            }

            Method::ConsumerGetStats => {
                let consumer = self.consumer_from_request_mut(request)?;
                let stats = consumer.get_stats(now_ms);
                Ok(Response::accept_data(serde_json::to_value(stats)?))
            }

            Method::ConsumerPause => {
                let consumer = self.consumer_from_request_mut(request)?;
                consumer.pause();
                Ok(Response::accept())
            }

            Method::ConsumerResume => {
                let consumer = self.consumer_from_request_mut(request)?;
                consumer.resume();
                Ok(Response::accept())
            }

            Method::ConsumerSetPreferredLayers => {
                let layers: PreferredLayers = parse_data(&request.data)?;
                let consumer = self.consumer_from_request_mut(request)?;
                consumer.set_preferred_layers(layers);
                Ok(Response::accept_data(serde_json::to_value(layers)?))
            }

            Method::ConsumerRequestKeyFrame => {
                let consumer = self.consumer_from_request(request)?;
                let consumer_id = consumer.id().to_string();
                let producer_id = consumer.producer_id().to_string();
                listener.on_consumer_key_frame_requested(&self.id, &consumer_id, &producer_id);
                Ok(Response::accept())
            }
        }
    }

    /// Router cascade: the producer this transport's consumers were
    /// bound to closed (possibly on another transport).
    pub fn producer_closed(&mut self, producer_id: &str, listener: &mut dyn TransportListener) {
        let consumer_ids: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.producer_id() == producer_id)
            .map(|(id, _)| id.clone())
            .collect();

        for consumer_id in consumer_ids {
            self.remove_consumer(&consumer_id);
            listener.on_consumer_producer_closed(&self.id, &consumer_id);
        }
    }

    /// Router cascade: pause/resume of the origin producer.
    pub fn producer_paused(&mut self, producer_id: &str) {
        for consumer in self.consumers.values_mut() {
            if consumer.producer_id() == producer_id {
                consumer.producer_paused();
            }
        }
    }

    pub fn producer_resumed(&mut self, producer_id: &str) {
        for consumer in self.consumers.values_mut() {
            if consumer.producer_id() == producer_id {
                consumer.producer_resumed();
            }
        }
    }

    /// Forward allocation limits into the bandwidth estimator.
    pub fn set_desired_bitrates(
        &mut self,
        min_bitrate: u32,
        max_padding_bitrate: u32,
        max_total_bitrate: u32,
    ) {
        if let Some(client) = &mut self.tcc_client {
            client.set_desired_bitrates(min_bitrate, max_padding_bitrate, max_total_bitrate);
        }
    }

    fn remove_consumer(&mut self, consumer_id: &str) {
        if let Some(consumer) = self.consumers.remove(consumer_id) {
            self.ssrc_consumer.remove(&consumer.media_ssrc());
        }
    }

    fn producer_from_request(&self, request: &Request) -> Result<&Producer, RequestError> {
        let id = request
            .internal
            .producer_id
            .as_deref()
            .ok_or_else(|| RequestError::Failed("request has no internal.producerId".into()))?;
        self.producers
            .get(id)
            .ok_or_else(|| RequestError::Failed("Producer not found".into()))
    }

    fn producer_from_request_mut(&mut self, request: &Request) -> Result<&mut Producer, RequestError> {
        let id = request
            .internal
            .producer_id
            .as_deref()
            .ok_or_else(|| RequestError::Failed("request has no internal.producerId".into()))?;
        self.producers
            .get_mut(id)
            .ok_or_else(|| RequestError::Failed("Producer not found".into()))
    }

    fn consumer_from_request(&self, request: &Request) -> Result<&Consumer, RequestError> {
        let id = request
            .internal
            .consumer_id
            .as_deref()
            .ok_or_else(|| RequestError::Failed("request has no internal.consumerId".into()))?;
        self.consumers
            .get(id)
            .ok_or_else(|| RequestError::Failed("Consumer not found".into()))
    }

    fn consumer_from_request_mut(&mut self, request: &Request) -> Result<&mut Consumer, RequestError> {
        let id = request
            .internal
            .consumer_id
            .as_deref()
            .ok_or_else(|| RequestError::Failed("request has no internal.consumerId".into()))?;
        self.consumers
            .get_mut(id)
            .ok_or_else(|| RequestError::Failed("Consumer not found".into()))
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(data: &serde_json::Value) -> Result<T, RequestError> {
    serde_json::from_value(data.clone()).map_err(|e| RequestError::TypeError(e.to_string()))
}

fn new_entity_id(id: Option<&str>) -> Result<String, RequestError> {
    match id {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(RequestError::Failed("request has no internal id".into())),
    }
}

/// Transport-side listener handed into the TCC client, collecting what
/// must be applied once the client borrow ends.
struct ClientHooks<'a> {
    transport_id: &'a str,
    now_ms: u64,
    next_wide_seq: &'a mut u16,
    send_transmission: &'a mut RateCalculator,
    listener: &'a mut dyn TransportListener,
    sent: Vec<PacketSendInfo>,
    bitrate_events: Vec<(u32, u32)>,
}

impl TwccClientListener for ClientHooks<'_> {
    fn on_available_bitrate(&mut self, available_bitrate: u32, previous_bitrate: u32) {
        self.bitrate_events.push((available_bitrate, previous_bitrate));
    }

    fn send_probation_packet(
        &mut self,
        packet: &mut RtpPacket,
        pacing_info: crate::bwe::PacingInfo,
    ) {
        let wide_seq = *self.next_wide_seq;
        if !packet.set_transport_wide_cc01(wide_seq) {
            return;
        }
        *self.next_wide_seq = self.next_wide_seq.wrapping_add(1);
        packet.set_abs_send_time(self.now_ms);

        self.sent.push(PacketSendInfo {
            ssrc: packet.ssrc(),
            wide_seq,
            rtp_seq: packet.sequence_number(),
            length: packet.len(),
            pacing_info,
        });

        self.send_transmission.update(packet.len(), self.now_ms);
        self.listener.send_rtp(self.transport_id, packet.as_bytes());
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(e: serde_json::Error) -> Self {
        RequestError::TypeError(e.to_string())
    }
}
