use core::time::Duration;

use log::trace;

use crate::bus::{Bus, CobIdSubscription};
use crate::constant::{SDO_PUBLISH_GAP, SDO_RESPONSE_TIMEOUT};
use crate::error::ErrorCode;
use crate::frame::Frame;

/// An outgoing frame together with the COB-ID its answer will carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub frame: Frame,
    pub response_cob_id: u16,
}

impl Request {
    pub fn new(frame: Frame, response_cob_id: u16) -> Request {
        Request {
            frame,
            response_cob_id,
        }
    }
}

/// The answer to a [`Request`].
#[derive(Debug)]
pub struct Response<'r> {
    pub frame: Frame,
    pub request: &'r Request,
}

/// Correlates requests with responses on the broadcast bus.
///
/// A request is answered by the first frame whose 11-bit identifier equals
/// the request's `response_cob_id`. The caller is responsible for keeping
/// transfers to the same peer from interleaving (see the per-peer lock in
/// the SDO client).
pub struct Client<'a, B: ?Sized> {
    pub bus: &'a B,
    pub timeout: Duration,
}

impl<'a, B: Bus + ?Sized> Client<'a, B> {
    pub fn new(bus: &'a B) -> Self {
        Client {
            bus,
            timeout: SDO_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_timeout(bus: &'a B, timeout: Duration) -> Self {
        Client { bus, timeout }
    }

    /// Sends a request and waits for the response with the default
    /// inter-frame gap.
    pub fn request<'r>(&self, request: &'r Request) -> Result<Response<'r>, ErrorCode> {
        self.request_min_duration(request, SDO_PUBLISH_GAP)
    }

    /// Sends a request and waits for the response, spacing the publish at
    /// least `min` after the previous one on this bus.
    ///
    /// The response subscription is registered before the request goes out
    /// and torn down on every exit path.
    pub fn request_min_duration<'r>(
        &self,
        request: &'r Request,
        min: Duration,
    ) -> Result<Response<'r>, ErrorCode> {
        let subscription = CobIdSubscription::new(self.bus, request.response_cob_id);

        self.bus
            .publish_min_duration(request.frame.to_can(), min)?;

        let frame = subscription.wait(self.timeout)?;
        trace!(
            "response on {:#x}: {:02x?}",
            request.response_cob_id,
            &frame.data
        );

        Ok(Response {
            frame: Frame::from_can(frame),
            request,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBus;
    use std::sync::Arc;

    #[test]
    fn test_request_gets_matching_response() {
        let bus = Arc::new(LoopbackBus::new());

        // Echo peer: answer anything on 0x601 with a fixed frame on 0x581.
        let peer_bus = bus.clone();
        bus.subscribe(Arc::new(move |frame: &crate::frame::CanFrame| {
            if frame.id == 0x601 {
                let reply = Frame::new(0x581, &[0x60, 0, 0, 0, 0, 0, 0, 0]);
                peer_bus.publish(reply.to_can()).unwrap();
            }
        }));

        let client = Client::new(&*bus);
        let request = Request::new(Frame::new(0x601, &[0x40, 0, 0, 0, 0, 0, 0, 0]), 0x581);
        let response = client.request(&request).unwrap();
        assert_eq!(response.frame.cob_id, 0x581);
        assert_eq!(response.frame.data[0], 0x60);
        assert_eq!(response.request.response_cob_id, 0x581);
    }

    #[test]
    fn test_request_times_out_without_peer() {
        let bus = LoopbackBus::new();
        let client = Client::with_timeout(&bus, Duration::from_millis(50));
        let request = Request::new(Frame::new(0x601, &[0x40, 0, 0, 0, 0, 0, 0, 0]), 0x581);
        assert_eq!(
            client.request(&request).unwrap_err(),
            ErrorCode::Timeout { cob_id: 0x581 }
        );
    }
}
