use std::collections::HashMap;

use crate::channel::RequestError;
use crate::producer::Producer;
use crate::rtp::{Mid, Rid, RtpHeader, Ssrc};

/// Demultiplexes inbound RTP to the owning producer.
///
/// Routing is by SSRC when known, falling back to the MID/RID header
/// extensions. A hit through MID/RID teaches the SSRC table so the fast
/// path applies from the next packet on.
#[derive(Debug, Default)]
pub struct RtpListener {
    ssrc_table: HashMap<Ssrc, String>,
    mid_table: HashMap<Mid, String>,
    rid_table: HashMap<Rid, String>,
}

impl RtpListener {
    pub fn new() -> Self {
        RtpListener::default()
    }

    /// Register a producer's SSRC/MID/RID. Any collision with another
    /// producer fails the whole registration and leaves the tables as
    /// they were.
    pub fn add_producer(&mut self, producer: &Producer) -> Result<(), RequestError> {
        let id = producer.id();

        for ssrc in producer.ssrcs() {
            if self.ssrc_table.get(&ssrc).is_some_and(|other| other != id) {
                return Err(RequestError::Failed(format!(
                    "ssrc {} already exists in RTP listener",
                    ssrc
                )));
            }
        }
        if let Some(mid) = producer.mid() {
            if self.mid_table.get(&mid).is_some_and(|other| other != id) {
                return Err(RequestError::Failed(format!(
                    "mid '{}' already exists in RTP listener",
                    mid
                )));
            }
        }
        for rid in producer.rids() {
            if self.rid_table.get(rid).is_some_and(|other| other != id) {
                return Err(RequestError::Failed(format!(
                    "rid '{}' already exists in RTP listener",
                    rid
                )));
            }
        }

        for ssrc in producer.ssrcs() {
            self.ssrc_table.insert(ssrc, id.to_string());
        }
        if let Some(mid) = producer.mid() {
            self.mid_table.insert(mid, id.to_string());
        }
        for rid in producer.rids() {
            self.rid_table.insert(*rid, id.to_string());
        }

        Ok(())
    }

    pub fn remove_producer(&mut self, producer_id: &str) {
        self.ssrc_table.retain(|_, id| id != producer_id);
        self.mid_table.retain(|_, id| id != producer_id);
        self.rid_table.retain(|_, id| id != producer_id);
    }

    /// Resolve by plain SSRC, as needed for RTCP lookups.
    pub fn get_producer_by_ssrc(&self, ssrc: Ssrc) -> Option<String> {
        self.ssrc_table.get(&ssrc).cloned()
    }

    /// Resolve the producer owning this packet, if any.
    pub fn get_producer(&mut self, header: &RtpHeader) -> Option<String> {
        if let Some(id) = self.ssrc_table.get(&header.ssrc) {
            return Some(id.clone());
        }

        let id = header
            .ext_vals
            .mid
            .and_then(|mid| self.mid_table.get(&mid))
            .or_else(|| {
                header
                    .ext_vals
                    .rid
                    .and_then(|rid| self.rid_table.get(&rid))
            })?
            .clone();

        // Learn the SSRC so the next packet hits the fast path.
        debug!(
            "learned ssrc {} for producer {} via mid/rid",
            header.ssrc, id
        );
        self.ssrc_table.insert(header.ssrc, id.clone());

        Some(id)
    }
}

/// Demultiplexes inbound SCTP messages to the owning data producer by
/// stream id. The SCTP association itself lives outside this crate.
#[derive(Debug, Default)]
pub struct SctpListener {
    stream_table: HashMap<u16, String>,
}

impl SctpListener {
    pub fn new() -> Self {
        SctpListener::default()
    }

    pub fn add_data_producer(
        &mut self,
        stream_id: u16,
        data_producer_id: &str,
    ) -> Result<(), RequestError> {
        if self.stream_table.contains_key(&stream_id) {
            return Err(RequestError::Failed(format!(
                "sctp stream id {} already exists in SCTP listener",
                stream_id
            )));
        }

        self.stream_table
            .insert(stream_id, data_producer_id.to_string());
        Ok(())
    }

    pub fn remove_data_producer(&mut self, data_producer_id: &str) {
        self.stream_table.retain(|_, id| id != data_producer_id);
    }

    pub fn get_data_producer(&self, stream_id: u16) -> Option<&str> {
        self.stream_table.get(&stream_id).map(|s| s.as_str())
    }
}
