//! Name to address resolution.
//!
//! The full pipeline: literal short-circuit, host tables, link-local
//! multicast, search expansion, parallel family queries with a
//! staggering delay, CNAME resolution, DNS64 synthesis and final
//! ordering.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use domain::base::iana::{Class, Rtype};
use domain::base::name::Name;
use domain::base::Message;
use tokio::time::sleep;

use crate::clock::Clock;
use crate::context::{resolve_question, ResolverContext};
use crate::dispatch::QuestionBytes;
use crate::dns64::{may_synthesize, Prefix64};
use crate::dot::PrivateDns;
use crate::error::{LookupError, QueryError};
use crate::events::EventLog;
use crate::hosts::Hosts;
use crate::lookup::search::candidates;
use crate::lookup::{
    collect_a, collect_aaaa, follow_cname, is_nxdomain, rtype_for,
    sock_types_for, AddrInfo, Family, HostResults, LookupArgs,
};
use crate::{mdns, sort};

//------------ lookup_host ---------------------------------------------------

/// Resolves a host name into its addresses.
pub(crate) async fn lookup_host<C: Clock>(
    ctx: &Arc<ResolverContext<C>>,
    private_dns: &Arc<PrivateDns<C>>,
    events: &Arc<EventLog>,
    system_hosts: &Hosts,
    input: &str,
    args: &LookupArgs,
    bypass_private_dns: bool,
) -> Result<HostResults, LookupError> {
    // A numeric literal never queries anything.
    if let Ok(addr) = IpAddr::from_str(input.trim()) {
        return literal_result(addr, args);
    }
    if args.flags.numeric_host {
        return Err(LookupError::HostNotFound);
    }

    let as_given = Name::<Vec<u8>>::from_str(
        input.trim().trim_end_matches('.'),
    )
    .map_err(|_| LookupError::HostNotFound)?;

    // The custom table is authoritative: a configured name never goes
    // to the DNS, even if the configured family does not match.
    let custom = ctx.custom_hosts();
    if let Some(addrs) = custom.lookup_host(&as_given) {
        return table_result(addrs, args);
    }
    if let Some(addrs) = system_hosts.lookup_host(&as_given) {
        return table_result(addrs, args);
    }

    let families = requested_families(ctx, args)?;

    // Link-local names go out over multicast where the network allows
    // it, with unicast as the fallback.
    if mdns::is_local_name(&as_given)
        && mdns::network_allows_mdns(&ctx.transport_types())
    {
        if let Some(results) =
            multicast_lookup(&as_given, &families, args).await
        {
            return Ok(results);
        }
    }

    let config = ctx.config();
    let cands = if mdns::is_local_name(&as_given) {
        vec![as_given.clone()]
    } else {
        candidates(input, &config.search_domains)?
    };

    let stagger = Duration::from_millis(
        ctx.flags().parallel_lookup_sleep_time_ms as u64,
    );
    let prefix = ctx.dns64().prefix();

    let mut saw_nodata = false;
    let mut saw_nxdomain = false;
    let mut last_err: Option<QueryError> = None;

    for cand in &cands {
        let family_answers = query_families(
            ctx,
            private_dns,
            events,
            cand,
            &families,
            stagger,
            bypass_private_dns,
        )
        .await;

        let mut v6 = Vec::new();
        let mut v4 = Vec::new();
        let mut canonical = None;
        let mut have_native_aaaa_answer = false;

        for (family, outcome) in &family_answers {
            match outcome {
                Ok(msg) => {
                    if is_nxdomain(msg) {
                        saw_nxdomain = true;
                        continue;
                    }
                    match extract_family(msg, cand, *family) {
                        Ok((addrs, owner)) => {
                            if addrs.is_empty() {
                                saw_nodata = true;
                            } else {
                                if owner != *cand {
                                    canonical =
                                        Some(owner.to_string());
                                }
                                match family {
                                    Family::V6 => {
                                        have_native_aaaa_answer = true;
                                        v6.extend(addrs)
                                    }
                                    Family::V4 => v4.extend(addrs),
                                }
                            }
                        }
                        Err(err) => last_err = Some(err),
                    }
                }
                Err(err) => last_err = Some(err.clone()),
            }
        }

        // DNS64: synthesize only when AAAA was wanted and came back
        // empty while a prefix is active.
        if let Some(prefix) = prefix {
            if families.contains(&Family::V6)
                && !have_native_aaaa_answer
                && v6.is_empty()
            {
                let v4_source = if families.contains(&Family::V4) {
                    v4.clone()
                } else {
                    query_v4_for_synthesis(
                        ctx,
                        private_dns,
                        events,
                        cand,
                        bypass_private_dns,
                    )
                    .await
                };
                v6.extend(synthesize(prefix, &v4_source));
            }
        }

        let mut addresses: Vec<IpAddr> = Vec::new();
        if families.contains(&Family::V6) {
            addresses.extend(v6.into_iter());
        }
        if families.contains(&Family::V4) {
            addresses.extend(v4.into_iter());
        }

        if !addresses.is_empty() {
            sort::sort_addresses(&mut addresses);
            return Ok(HostResults {
                entries: addresses
                    .into_iter()
                    .map(|addr| AddrInfo {
                        addr,
                        sock_types: sock_types_for(args.sock_type),
                    })
                    .collect(),
                canonical,
            });
        }
    }

    if saw_nodata {
        Err(LookupError::NoData)
    } else if saw_nxdomain {
        Err(LookupError::HostNotFound)
    } else if let Some(err) = last_err {
        Err(err.into())
    } else {
        Err(LookupError::HostNotFound)
    }
}

//------------ Family handling -----------------------------------------------

/// The families to query, after caller restriction and interface
/// gating.
fn requested_families<C: Clock>(
    ctx: &ResolverContext<C>,
    args: &LookupArgs,
) -> Result<Vec<Family>, LookupError> {
    let mut families = match args.family {
        Some(family) => vec![family],
        None => vec![Family::V6, Family::V4],
    };
    if args.flags.addr_config {
        let addr_config = ctx.addr_config();
        families.retain(|family| match family {
            Family::V4 => addr_config.have_ipv4,
            Family::V6 => addr_config.usable_ipv6(),
        });
    }
    if families.is_empty() {
        return Err(LookupError::NoData);
    }
    Ok(families)
}

/// Queries all requested families for one candidate name.
///
/// When both families are wanted they run in parallel, the second
/// staggered slightly so a cache hit on the first can spare the
/// upstream a duplicate.
async fn query_families<C: Clock>(
    ctx: &Arc<ResolverContext<C>>,
    private_dns: &Arc<PrivateDns<C>>,
    events: &Arc<EventLog>,
    qname: &Name<Vec<u8>>,
    families: &[Family],
    stagger: Duration,
    bypass_private_dns: bool,
) -> Vec<(Family, Result<Message<Bytes>, QueryError>)> {
    if families.len() == 2 {
        let first = families[0];
        let second = families[1];
        let first_fut = resolve_question(
            ctx,
            private_dns,
            events,
            qname,
            rtype_for(first),
            bypass_private_dns,
        );
        let second_fut = async {
            if !stagger.is_zero() {
                sleep(stagger).await;
            }
            resolve_question(
                ctx,
                private_dns,
                events,
                qname,
                rtype_for(second),
                bypass_private_dns,
            )
            .await
        };
        let (first_res, second_res) = tokio::join!(first_fut, second_fut);
        vec![(first, first_res), (second, second_res)]
    } else {
        let family = families[0];
        let result = resolve_question(
            ctx,
            private_dns,
            events,
            qname,
            rtype_for(family),
            bypass_private_dns,
        )
        .await;
        vec![(family, result)]
    }
}

/// Pulls the addresses of one family out of an answer, following the
/// CNAME chain.
fn extract_family(
    msg: &Message<Bytes>,
    qname: &Name<Vec<u8>>,
    family: Family,
) -> Result<(Vec<IpAddr>, Name<Vec<u8>>), QueryError> {
    let owner = follow_cname(msg, qname)?;
    let addrs = match family {
        Family::V4 => collect_a(msg, &owner)?
            .into_iter()
            .map(IpAddr::V4)
            .collect(),
        Family::V6 => collect_aaaa(msg, &owner)?
            .into_iter()
            .map(IpAddr::V6)
            .collect(),
    };
    Ok((addrs, owner))
}

//------------ DNS64 ---------------------------------------------------------

/// Fetches IPv4 addresses for synthesis when the caller did not ask for
/// IPv4 itself.
async fn query_v4_for_synthesis<C: Clock>(
    ctx: &Arc<ResolverContext<C>>,
    private_dns: &Arc<PrivateDns<C>>,
    events: &Arc<EventLog>,
    qname: &Name<Vec<u8>>,
    bypass_private_dns: bool,
) -> Vec<IpAddr> {
    match resolve_question(
        ctx,
        private_dns,
        events,
        qname,
        Rtype::A,
        bypass_private_dns,
    )
    .await
    {
        Ok(msg) => match extract_family(&msg, qname, Family::V4) {
            Ok((addrs, _)) => addrs,
            Err(_) => Vec::new(),
        },
        Err(_) => Vec::new(),
    }
}

/// Maps IPv4 results through the prefix, skipping addresses that make
/// no sense behind a NAT64.
fn synthesize(prefix: Prefix64, v4: &[IpAddr]) -> Vec<IpAddr> {
    v4.iter()
        .filter_map(|addr| match addr {
            IpAddr::V4(v4) if may_synthesize(*v4) => {
                Some(IpAddr::V6(prefix.synthesize(*v4)))
            }
            _ => None,
        })
        .collect()
}

//------------ Multicast path ------------------------------------------------

/// Tries the multicast groups, returning `None` to fall back to
/// unicast.
async fn multicast_lookup(
    qname: &Name<Vec<u8>>,
    families: &[Family],
    args: &LookupArgs,
) -> Option<HostResults> {
    let mut addresses = Vec::new();
    for family in families {
        let Ok(question) =
            QuestionBytes::new(qname, rtype_for(*family), Class::IN)
        else {
            continue;
        };
        let (payload, msg) = question.materialize(false);
        match mdns::query(&payload, &msg, mdns::MDNS_TIMEOUT).await {
            Ok(answer) => {
                if let Ok((addrs, _)) =
                    extract_family(&answer, qname, *family)
                {
                    addresses.extend(addrs);
                }
            }
            Err(err) => {
                tracing::debug!(%err, "multicast query failed");
            }
        }
    }
    if addresses.is_empty() {
        return None;
    }
    sort::sort_addresses(&mut addresses);
    Some(HostResults {
        entries: addresses
            .into_iter()
            .map(|addr| AddrInfo {
                addr,
                sock_types: sock_types_for(args.sock_type),
            })
            .collect(),
        canonical: None,
    })
}

//------------ Table results -------------------------------------------------

/// Builds the result for a numeric literal.
fn literal_result(
    addr: IpAddr,
    args: &LookupArgs,
) -> Result<HostResults, LookupError> {
    let matches = match (args.family, addr) {
        (Some(Family::V4), IpAddr::V6(_)) => false,
        (Some(Family::V6), IpAddr::V4(_)) => false,
        _ => true,
    };
    if !matches {
        return Err(LookupError::NoData);
    }
    Ok(HostResults {
        entries: vec![AddrInfo {
            addr,
            sock_types: sock_types_for(args.sock_type),
        }],
        canonical: None,
    })
}

/// Builds the result from a host-table hit.
fn table_result(
    addrs: &[IpAddr],
    args: &LookupArgs,
) -> Result<HostResults, LookupError> {
    let mut addresses: Vec<IpAddr> = addrs
        .iter()
        .copied()
        .filter(|addr| match (args.family, addr) {
            (Some(Family::V4), IpAddr::V6(_)) => false,
            (Some(Family::V6), IpAddr::V4(_)) => false,
            _ => true,
        })
        .collect();
    if addresses.is_empty() {
        return Err(LookupError::NoData);
    }
    sort::sort_addresses(&mut addresses);
    Ok(HostResults {
        entries: addresses
            .into_iter()
            .map(|addr| AddrInfo {
                addr,
                sock_types: sock_types_for(args.sock_type),
            })
            .collect(),
        canonical: None,
    })
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> LookupArgs {
        LookupArgs::on_network(1, 1000)
    }

    #[test]
    fn literal_bypasses_everything() {
        let res = literal_result("192.0.2.7".parse().unwrap(), &args());
        let res = res.unwrap();
        assert_eq!(res.entries.len(), 1);
        assert_eq!(res.entries[0].sock_types.len(), 2);

        let mut v6_only = args();
        v6_only.family = Some(Family::V6);
        assert!(literal_result(
            "192.0.2.7".parse().unwrap(),
            &v6_only
        )
        .is_err());
    }

    #[test]
    fn table_results_respect_family() {
        let addrs: Vec<IpAddr> = vec![
            "192.0.2.1".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
        ];
        let mut v4_only = args();
        v4_only.family = Some(Family::V4);
        let res = table_result(&addrs, &v4_only).unwrap();
        assert_eq!(res.addresses(), vec![addrs[0]]);

        let res = table_result(&addrs, &args()).unwrap();
        assert_eq!(res.entries.len(), 2);
    }

    #[test]
    fn synthesis_skips_special_ranges() {
        let prefix: Prefix64 = "64:ff9b::/96".parse().unwrap();
        let v4: Vec<IpAddr> = vec![
            "1.2.3.4".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            "169.254.1.1".parse().unwrap(),
        ];
        let out = synthesize(prefix, &v4);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0],
            "64:ff9b::102:304".parse::<IpAddr>().unwrap()
        );
    }
}
