//! Fuzz target for SSH input parsing.
//!
//! Feeds random bytes to the identification reader, the unencrypted packet
//! decoder and the connection message decoder looking for panics, hangs and
//! unbounded allocation.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use bytes::{Bytes, BytesMut};
use fjord_proto::ssh::connection::messages::ConnectionMessage;
use fjord_proto::ssh::packet::PacketDecoder;
use fjord_proto::ssh::version::IdentificationReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);
    let mut reader = IdentificationReader::new();
    if let Ok(true) = reader.read_identification(&mut buf) {
        let mut decoder = PacketDecoder::new();
        while let Ok(Some(payload)) = decoder.decode(&mut buf) {
            let _ = ConnectionMessage::decode(payload);
        }
    }

    // payloads on their own, as they arrive after decryption
    let _ = ConnectionMessage::decode(Bytes::copy_from_slice(data));
});
