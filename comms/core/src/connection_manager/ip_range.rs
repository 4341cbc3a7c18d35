// Copyright 2023. The Sable Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! The /16-equivalent address grouping used to keep connected peers spread across networks. An IPv4 address
//! groups by its first two octets; a native IPv6 address groups by its first 16 bits.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpGroup([u8; 3]);

pub fn ip_group(ip: &IpAddr) -> IpGroup {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            IpGroup([4, octets[0], octets[1]])
        },
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => {
                let octets = v4.octets();
                IpGroup([4, octets[0], octets[1]])
            },
            None => {
                let octets = v6.octets();
                IpGroup([6, octets[0], octets[1]])
            },
        },
    }
}

/// Loopback and private-range peers are exempt from the group-uniqueness rule.
pub fn is_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback() ||
                v6.to_ipv4_mapped()
                    .map(|v4| v4.is_loopback() || v4.is_private() || v4.is_link_local())
                    .unwrap_or(false)
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn v4_addresses_group_by_slash_16() {
        let a = ip_group(&"203.0.1.1".parse().unwrap());
        let b = ip_group(&"203.0.200.9".parse().unwrap());
        let c = ip_group(&"203.1.1.1".parse().unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn mapped_v6_groups_with_its_v4_equivalent() {
        let v4 = ip_group(&"203.0.113.7".parse().unwrap());
        let mapped = ip_group(&"::ffff:203.0.113.9".parse().unwrap());
        assert_eq!(v4, mapped);
    }

    #[test]
    fn native_v6_does_not_collide_with_v4_groups() {
        let v6 = ip_group(&"2001:db8::1".parse().unwrap());
        let v4 = ip_group(&"32.1.0.1".parse().unwrap());
        assert_ne!(v6, v4);
    }

    #[test]
    fn local_addresses_are_recognized() {
        assert!(is_local(&"127.0.0.1".parse().unwrap()));
        assert!(is_local(&"192.168.1.10".parse().unwrap()));
        assert!(is_local(&"::1".parse().unwrap()));
        assert!(!is_local(&"203.0.113.7".parse().unwrap()));
    }
}
