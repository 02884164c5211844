#![no_main]
use blocklock::protocol::{parse_reply, RespCodec};
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Feed the request decoder in uneven chunks, the way reads arrive.
    let mut codec = RespCodec::new(4096);
    let mut buf = BytesMut::new();
    'feed: for chunk in data.chunks(7) {
        buf.extend_from_slice(chunk);
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => break 'feed,
            }
        }
    }

    if let Ok(Some((_, used))) = parse_reply(data) {
        assert!(used <= data.len());
    }
});
