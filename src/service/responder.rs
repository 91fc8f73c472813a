use std::fmt;

use crate::codec::Value;
use crate::protocol::Context;
use crate::service::Service;
use crate::Error;

/// one-shot deferred reply to a request
///
/// obtained from [`Service::response`]. Only the first `ok`/`fail` is sent;
/// a responder dropped without being used reports an error to the caller.
pub struct Responder {
    // None when the request expects no reply
    bound: Option<(Service, u64)>,
    ctx: Context,
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("session", &self.ctx.session)
            .field("source", &self.ctx.source)
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl Responder {
    pub(crate) fn new(service: Option<(Service, u64)>, ctx: Context) -> Self {
        Responder { bound: service, ctx }
    }

    /// reply with the given arguments, returns whether a reply was sent
    pub fn ok(&self, args: &[Value]) -> Result<bool, Error> {
        self.respond(true, args)
    }

    /// reply with an error
    pub fn fail(&self) -> Result<bool, Error> {
        self.respond(false, &[])
    }

    /// `ok == false` sends an error reply instead of `args`
    pub fn respond(&self, ok: bool, args: &[Value]) -> Result<bool, Error> {
        let (service, id) = match &self.bound {
            Some(b) => b,
            None => return Ok(false),
        };
        if ok {
            // pack before claiming the reply, a codec error leaves it pending
            let payload = self.ctx.proto.pack(args)?;
            if !service.claim_responder(*id) {
                return Ok(false);
            }
            Ok(service.reply(&self.ctx, payload))
        } else {
            if !service.claim_responder(*id) {
                return Ok(false);
            }
            service.reply_error(self.ctx.source, self.ctx.session);
            Ok(true)
        }
    }

    /// true until a reply was sent, or the caller went away
    pub fn is_pending(&self) -> bool {
        match &self.bound {
            Some((service, id)) => service.responder_pending(*id),
            None => false,
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some((service, id)) = &self.bound {
            if service.claim_responder(*id) {
                warn!(
                    "responder dropped without reply, session={} source={}",
                    self.ctx.session, self.ctx.source
                );
                service.reply_error(self.ctx.source, self.ctx.session);
            }
        }
    }
}
