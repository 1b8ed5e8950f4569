//! Locally synthesized DNS answers.

use std::net::IpAddr;
use std::str::FromStr;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, SOA};
use hickory_proto::rr::{Name, RData, Record};

/// TTL of every synthesized record.
pub const SYNTHETIC_TTL: u32 = 5;

/// Owner of the negative-caching SOA record in blocked answers.
const BLOCKED_ZONE: &str = "nullroute.vpn.invalid.";

fn soa_record() -> Record {
    let zone = Name::from_str(BLOCKED_ZONE).unwrap_or_else(|_| Name::root());
    let soa = SOA::new(zone.clone(), zone.clone(), 0, 0, 0, 0, SYNTHETIC_TTL);
    Record::from_rdata(zone, SYNTHETIC_TTL, RData::SOA(soa))
}

/// Answer for a blocked name: `NOERROR`, no answers, SOA in authority.
///
/// The request is echoed back with the response bit set, so flags such as
/// RD are preserved and AA stays unset.
pub fn blocked_response(query: &Message) -> Message {
    let mut response = query.clone();
    response
        .set_message_type(MessageType::Response)
        .set_response_code(ResponseCode::NoError)
        .add_name_server(soa_record());
    response
}

/// Authoritative answer pointing the first question at `target`.
///
/// The record type follows the family of `target`. A target that is not an
/// address yields a `NOERROR` response without answers.
pub fn redirected_response(query: &Message, target: &str) -> Message {
    let mut response = query.clone();
    response
        .set_message_type(MessageType::Response)
        .set_authoritative(true)
        .set_recursion_desired(false)
        .set_response_code(ResponseCode::NoError);

    let Some(question) = query.queries().first() else {
        return response;
    };

    match IpAddr::from_str(target.trim()) {
        Ok(IpAddr::V4(address)) => {
            response.add_answer(Record::from_rdata(
                question.name().clone(),
                SYNTHETIC_TTL,
                RData::A(A(address)),
            ));
        }
        Ok(IpAddr::V6(address)) => {
            response.add_answer(Record::from_rdata(
                question.name().clone(),
                SYNTHETIC_TTL,
                RData::AAAA(AAAA(address)),
            ));
        }
        Err(e) => {
            tracing::debug!(redirect = %target, error = %e, "Redirect target is not an address");
        }
    }

    response
}
