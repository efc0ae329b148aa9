//! DNS query filtering module.
//!
//! Decides per source whether a resolved category may be served and, when
//! it may not, builds the sinkhole response returned in place of the real
//! answer.

mod policy;

pub use policy::{Decision, PolicyTable, SourcePolicy};

use std::net::IpAddr;

use tracing::warn;

use crate::dns::{CLASS_IN, DnsQuery, DnsRecord, DnsResponse, TYPE_A, TYPE_AAAA};

/// EDNS0 UDP payload size advertised on synthesized responses.
const EDNS_UDP_SIZE: u16 = 4096;

/// Create the response returned for a blocked query.
///
/// Every A question is answered with an IPv4 `sinkhole`, every AAAA
/// question with an IPv6 one. Other questions, and address questions whose
/// family does not match the sinkhole, are left unanswered.
///
/// The block decision is made on the first question alone, yet every address
/// question in `query` is sinkholed, including ones for other names.
pub fn blocked_response(query: &DnsQuery, sinkhole: IpAddr, ttl: u32) -> DnsResponse {
    let mut response = DnsResponse::reply_to(query);

    for question in &query.questions {
        let rdata = match (question.qtype, sinkhole) {
            (TYPE_A, IpAddr::V4(addr)) => addr.octets().to_vec(),
            (TYPE_AAAA, IpAddr::V6(addr)) => addr.octets().to_vec(),
            (TYPE_A, IpAddr::V6(_)) | (TYPE_AAAA, IpAddr::V4(_)) => {
                warn!(
                    domain = %question.domain,
                    qtype = question.qtype,
                    %sinkhole,
                    "sinkhole address does not fit question type, skipping"
                );
                continue;
            }
            _ => continue,
        };

        response.answers.push(DnsRecord {
            name: question.domain.clone(),
            rtype: question.qtype,
            class: CLASS_IN,
            ttl,
            rdata,
        });
    }

    response.additionals.push(DnsRecord::edns(EDNS_UDP_SIZE));
    response
}
