//! Request dispatch by service hash and method ordinal.
//!
//! The dispatcher is the [`MessageHandler`] a [`Server`](crate::Server)
//! installs on its listener. For each frame body it decodes a request,
//! calls the method, and queues the framed reply on the same connection.
//!
//! Failures of a call (unknown service or method, argument mismatch, an
//! error or panic in the method) become fault replies. Only an undecodable
//! envelope is fatal to the connection.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::connection::Connection;
use crate::envelope::{Codec, ProstCodec, Reply, Request};
use crate::error::{Error, Result};
use crate::frame;
use crate::listener::MessageHandler;
use crate::macros::{debug, error, trace, warn};
use crate::send_queue::Payload;
use crate::service::{Service, ServiceDescriptor};
use crate::status::{Code, Status};

pub struct Dispatcher {
    services: HashMap<u64, ServiceDescriptor>,
    codec: Box<dyn Codec>,
    strict: bool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_codec(ProstCodec)
    }

    pub fn with_codec<C: Codec>(codec: C) -> Self {
        Self {
            services: HashMap::new(),
            codec: Box::new(codec),
            strict: true,
        }
    }

    /// Reply with a fault to unknown services and methods (the default),
    /// or drop those requests without a reply.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Register a service. A later service with the same hash replaces
    /// an earlier one.
    pub fn add_service<S: Service>(&mut self, service: S) {
        let desc = service.descriptor();
        debug!(
            "register service {} ({:#018x}), {} methods",
            desc.name(),
            desc.hash(),
            desc.len()
        );
        if let Some(old) = self.services.insert(desc.hash(), desc) {
            warn!("service {} registered twice", old.name());
        }
    }

    pub fn service(&self, hash: u64) -> Option<&ServiceDescriptor> {
        self.services.get(&hash)
    }

    /// Run one request. `None` means no reply is sent.
    pub fn invoke(&self, req: Request) -> Option<Reply> {
        let call_id = req.call_id;

        let Some(service) = self.services.get(&req.service_hash) else {
            debug!("call {}: unknown service {:#018x}", call_id, req.service_hash);
            return self.unroutable(
                call_id,
                Status::new(
                    Code::UnknownService,
                    format!("unknown service {:#018x}", req.service_hash),
                ),
            );
        };
        let Some(method) = service.method(req.ordinal) else {
            debug!("call {}: {} has no ordinal {}", call_id, service.name(), req.ordinal);
            return self.unroutable(
                call_id,
                Status::new(
                    Code::UnknownMethod,
                    format!(
                        "service {} has {} methods, no ordinal {}",
                        service.name(),
                        service.len(),
                        req.ordinal
                    ),
                ),
            );
        };

        trace!("call {}: {}.{}", call_id, service.name(), method.signature());
        let args = req.args;
        let reply = match panic::catch_unwind(AssertUnwindSafe(|| method.call(args))) {
            Ok(Ok(value)) => Reply::ok(call_id, value),
            Ok(Err(status)) => Reply::fault(call_id, status),
            Err(payload) => {
                let msg = panic_message(&*payload);
                error!(
                    "call {}: {}.{} panicked: {}",
                    call_id,
                    service.name(),
                    method.signature().name,
                    msg
                );
                Reply::fault(call_id, Status::internal(format!("method panicked: {msg}")))
            }
        };
        Some(reply)
    }

    fn unroutable(&self, call_id: u64, status: Status) -> Option<Reply> {
        self.strict.then(|| Reply::fault(call_id, status))
    }

    /// Decode one frame body, run it, and encode the framed reply.
    ///
    /// The reply is written into `output` with its length prefix. Returns
    /// false if there is nothing to send.
    pub fn handle_body(&self, body: &[u8], output: &mut Vec<u8>) -> Result<bool> {
        let req = self.codec.decode_request(body)?;
        let Some(reply) = self.invoke(req) else {
            return Ok(false);
        };
        frame::encode_with(output, |out| self.codec.encode_reply(&reply, out))?;
        Ok(true)
    }
}

impl MessageHandler for Dispatcher {
    fn on_message(&self, conn: &Arc<Connection>, body: &[u8]) -> Result<()> {
        let mut payload = match conn.rent_send_buffer() {
            Some(buf) => Payload::Pooled(buf),
            None => Payload::Owned(Vec::new()),
        };
        if !self.handle_body(body, payload.as_mut_vec())? {
            return Ok(());
        }
        match conn.send_framed(payload) {
            // closing already, nothing left to answer
            Err(Error::ConnectionClosed | Error::ChannelClosed) => Ok(()),
            other => other,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}
