//! Address to name resolution.
//!
//! Reverse lookups go through PTR records, transparently chasing the
//! CNAMEs used by classless reverse delegation (RFC 2317). Synthesized
//! NAT64 addresses are first tried as-is; when the synthesized reverse
//! zone knows nothing, the embedded IPv4 address is extracted and its
//! reverse looked up instead, with the answer attributed back to the
//! original IPv6 address by the caller.

use std::net::IpAddr;
use std::sync::Arc;

use domain::base::iana::Rtype;
use domain::base::name::Name;

use crate::clock::Clock;
use crate::context::{resolve_question, ResolverContext};
use crate::dns64::{reverse_v4_name, reverse_v6_name};
use crate::dot::PrivateDns;
use crate::error::{LookupError, QueryError};
use crate::events::EventLog;
use crate::hosts::Hosts;
use crate::lookup::{collect_ptr, follow_cname, is_nxdomain};

/// Bound on reverse-delegation requeries.
const MAX_PTR_CHASE: usize = 8;

//------------ lookup_addr ---------------------------------------------------

/// Resolves an address into its host names.
pub(crate) async fn lookup_addr<C: Clock>(
    ctx: &Arc<ResolverContext<C>>,
    private_dns: &Arc<PrivateDns<C>>,
    events: &Arc<EventLog>,
    system_hosts: &Hosts,
    addr: IpAddr,
    bypass_private_dns: bool,
) -> Result<Vec<Name<Vec<u8>>>, LookupError> {
    // Host tables first, custom then system.
    let custom = ctx.custom_hosts();
    if let Some(names) = custom.lookup_addr(addr) {
        return Ok(names.to_vec());
    }
    if let Some(names) = system_hosts.lookup_addr(addr) {
        return Ok(names.to_vec());
    }

    // A synthesized address is tried verbatim; only a definite
    // "no such name" re-routes to the embedded IPv4 address.
    if let IpAddr::V6(v6) = addr {
        if let Some(prefix) = ctx.dns64().prefix() {
            if let Some(embedded) = prefix.extract(v6) {
                match ptr_chase(
                    ctx,
                    private_dns,
                    events,
                    reverse_v6_name(v6),
                    bypass_private_dns,
                )
                .await
                {
                    Ok(names) => return Ok(names),
                    Err(LookupError::HostNotFound)
                    | Err(LookupError::NoData) => {
                        return ptr_chase(
                            ctx,
                            private_dns,
                            events,
                            reverse_v4_name(embedded),
                            bypass_private_dns,
                        )
                        .await;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }

    let rname = match addr {
        IpAddr::V4(v4) => reverse_v4_name(v4),
        IpAddr::V6(v6) => reverse_v6_name(v6),
    };
    ptr_chase(ctx, private_dns, events, rname, bypass_private_dns).await
}

/// Issues PTR queries, following reverse-delegation CNAMEs across
/// messages up to a bound.
async fn ptr_chase<C: Clock>(
    ctx: &Arc<ResolverContext<C>>,
    private_dns: &Arc<PrivateDns<C>>,
    events: &Arc<EventLog>,
    mut rname: Name<Vec<u8>>,
    bypass_private_dns: bool,
) -> Result<Vec<Name<Vec<u8>>>, LookupError> {
    let mut saw_nxdomain = false;
    for _ in 0..MAX_PTR_CHASE {
        let msg = match resolve_question(
            ctx,
            private_dns,
            events,
            &rname,
            Rtype::PTR,
            bypass_private_dns,
        )
        .await
        {
            Ok(msg) => msg,
            Err(err) => return Err(err.into()),
        };

        if is_nxdomain(&msg) {
            saw_nxdomain = true;
            break;
        }

        let owner = follow_cname(&msg, &rname)
            .map_err(|_: QueryError| LookupError::Fail)?;
        let names = collect_ptr(&msg, &owner)
            .map_err(|_: QueryError| LookupError::Fail)?;
        if !names.is_empty() {
            return Ok(names);
        }

        if owner != rname {
            // The answer delegated us elsewhere without carrying the
            // PTR itself; ask again at the target.
            rname = owner;
            continue;
        }
        break;
    }

    if saw_nxdomain {
        Err(LookupError::HostNotFound)
    } else {
        Err(LookupError::NoData)
    }
}
