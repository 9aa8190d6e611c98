//! Blocking client.
//!
//! One call is in flight per `Client`: `invoke` holds the connection while
//! it writes the request and reads frames until the reply arrives. Share a
//! client across threads with `Arc`, or open one per thread for parallel
//! calls.
//!
//! A call that timed out may still be answered later. Such a stale reply
//! is skipped by the next call, which waits for its own call id.

use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::MAX_FRAME_SIZE;
use crate::envelope::{Codec, ProstCodec, Request};
use crate::error::{Error, Result};
use crate::frame::{self, FrameDecoder};
use crate::macros::trace;
use crate::value::Value;

#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub connect_timeout: Option<Duration>,
    /// Bound on waiting for a reply. `None` waits forever.
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(5)),
            read_timeout: None,
            write_timeout: Some(Duration::from_secs(5)),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(mut self, d: Option<Duration>) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn read_timeout(mut self, d: Option<Duration>) -> Self {
        self.read_timeout = d;
        self
    }

    pub fn write_timeout(mut self, d: Option<Duration>) -> Self {
        self.write_timeout = d;
        self
    }

    pub fn max_frame_size(mut self, n: usize) -> Self {
        assert!(n <= u32::MAX as usize, "frame length must fit the u32 prefix");
        self.max_frame_size = n;
        self
    }
}

pub struct Client {
    inner: Mutex<Inner>,
    codec: Box<dyn Codec>,
    peer: SocketAddr,
    max_frame_size: usize,
}

struct Inner {
    stream: TcpStream,
    decoder: FrameDecoder<Vec<u8>>,
    next_call: u64,
    output: Vec<u8>,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::connect_with(addr, ClientConfig::default())
    }

    pub fn connect_with<A: ToSocketAddrs>(addr: A, config: ClientConfig) -> Result<Self> {
        let stream = connect_any(addr, config.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(config.read_timeout)?;
        stream.set_write_timeout(config.write_timeout)?;
        let peer = stream.peer_addr()?;

        Ok(Self {
            inner: Mutex::new(Inner {
                stream,
                decoder: FrameDecoder::new(vec![0; 4096], config.max_frame_size),
                next_call: 0,
                output: Vec::with_capacity(4096),
            }),
            codec: Box::new(ProstCodec),
            peer,
            max_frame_size: config.max_frame_size,
        })
    }

    /// Replace the envelope codec. Both ends must agree on it.
    pub fn with_codec<C: Codec>(mut self, codec: C) -> Self {
        self.codec = Box::new(codec);
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Call method `ordinal` (1-based) of service `service_hash` and wait
    /// for its single result value.
    pub fn invoke(&self, service_hash: u64, ordinal: u32, args: Vec<Value>) -> Result<Value> {
        let mut inner = self.inner.lock();
        let Inner {
            stream,
            decoder,
            next_call,
            output,
        } = &mut *inner;

        *next_call += 1;
        let call_id = *next_call;
        let req = Request {
            call_id,
            service_hash,
            ordinal,
            args,
        };

        output.clear();
        frame::encode_with(output, |out| self.codec.encode_request(&req, out))?;
        let body_len = output.len() - frame::HEAD_SIZE;
        if body_len > self.max_frame_size {
            return Err(Error::FrameTooLarge(body_len, self.max_frame_size));
        }
        stream.write_all(output)?;
        trace!("call {}: sent {} bytes", call_id, output.len());

        loop {
            if let Some(body) = decoder.next_frame()? {
                let reply = self.codec.decode_reply(body)?;
                if reply.call_id < call_id {
                    trace!("call {}: skip stale reply to {}", call_id, reply.call_id);
                    continue;
                }
                if reply.call_id != call_id {
                    return Err(Error::CallMismatch {
                        sent: call_id,
                        received: reply.call_id,
                    });
                }
                return reply.into_result();
            }
            match decoder.read_from(&*stream) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(_) => {}
                Err(Error::IoFail(e)) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("peer", &self.peer).finish()
    }
}

fn connect_any<A: ToSocketAddrs>(addr: A, timeout: Option<Duration>) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in addr.to_socket_addrs()? {
        let res = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        };
        match res {
            Ok(s) => return Ok(s),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "no address to connect"))
        .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Reply;
    use crate::value::{FromValue, IntoValue};
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    // Answers one request with whatever `reply` builds, over a plain socket.
    fn fake_server<F>(reply: F) -> SocketAddr
    where
        F: FnOnce(Request) -> Reply + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut dec = FrameDecoder::new(vec![0; 64], 1 << 20);
            let req = loop {
                if let Some(body) = dec.next_frame().unwrap() {
                    break ProstCodec.decode_request(body).unwrap();
                }
                let mut buf = [0; 256];
                let n = s.read(&mut buf).unwrap();
                dec.feed(&buf[..n]).unwrap();
            };
            let mut out = Vec::new();
            frame::encode_with(&mut out, |o| ProstCodec.encode_reply(&reply(req), o)).unwrap();
            s.write_all(&out).unwrap();
        });
        addr
    }

    #[test]
    fn invoke_returns_result() {
        let addr = fake_server(|req| {
            let a = i64::from_value(req.args[0].clone()).unwrap();
            let b = i64::from_value(req.args[1].clone()).unwrap();
            Reply::ok(req.call_id, (a * b).into_value())
        });
        let client = Client::connect(addr).unwrap();
        let v = client
            .invoke(1, 1, vec![6i64.into_value(), 7i64.into_value()])
            .unwrap();
        assert_eq!(i64::from_value(v), Ok(42));
    }

    #[test]
    fn mismatched_call_id_is_rejected() {
        let addr = fake_server(|req| Reply::ok(req.call_id + 100, Value::unit()));
        let client = Client::connect(addr).unwrap();
        assert!(matches!(
            client.invoke(1, 1, vec![]),
            Err(Error::CallMismatch { sent: 1, received: 101 })
        ));
    }

    fn read_request(s: &mut TcpStream, dec: &mut FrameDecoder) -> Request {
        loop {
            if let Some(body) = dec.next_frame().unwrap() {
                return ProstCodec.decode_request(body).unwrap();
            }
            let mut buf = [0; 256];
            let n = s.read(&mut buf).unwrap();
            dec.feed(&buf[..n]).unwrap();
        }
    }

    fn write_reply(s: &mut TcpStream, reply: &Reply) {
        let mut out = Vec::new();
        frame::encode_with(&mut out, |o| ProstCodec.encode_reply(reply, o)).unwrap();
        s.write_all(&out).unwrap();
    }

    #[test]
    fn late_reply_is_skipped_by_next_call() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut dec = FrameDecoder::new(vec![0; 64], 1 << 20);
            let first = read_request(&mut s, &mut dec);
            thread::sleep(Duration::from_millis(200));
            write_reply(&mut s, &Reply::ok(first.call_id, 1i64.into_value()));
            let second = read_request(&mut s, &mut dec);
            write_reply(&mut s, &Reply::ok(second.call_id, 2i64.into_value()));
        });

        let config = ClientConfig::default().read_timeout(Some(Duration::from_millis(50)));
        let client = Client::connect_with(addr, config).unwrap();
        assert!(matches!(client.invoke(1, 1, vec![]), Err(Error::IoFail(_))));

        // the answer to the first call arrives while nobody waits for it
        thread::sleep(Duration::from_millis(300));
        let v = client.invoke(1, 1, vec![]).unwrap();
        assert_eq!(i64::from_value(v), Ok(2));
    }

    #[test]
    fn oversized_request_is_not_sent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ClientConfig::default().max_frame_size(16);
        let client = Client::connect_with(listener.local_addr().unwrap(), config).unwrap();
        let err = client.invoke(1, 1, vec![vec![0u8; 64].into_value()]);
        assert!(matches!(err, Err(Error::FrameTooLarge(_, 16))));
    }

    #[test]
    fn read_timeout_surfaces_as_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ClientConfig::default().read_timeout(Some(Duration::from_millis(50)));
        let client = Client::connect_with(listener.local_addr().unwrap(), config).unwrap();
        assert!(matches!(client.invoke(1, 1, vec![]), Err(Error::IoFail(_))));
    }
}
