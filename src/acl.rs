//! Access control: map a requested destination to a routing action.
//!
//! # Example
//!
//! ```
//! # use tunnelkeeper::acl::*;
//! let yaml = r#"
//! fallback: Proxy
//! rules:
//!   - action: Block
//!     address:
//!       Specif:
//!         Domain:
//!           wildcard: "*.ads.example.com"
//!   - action: Hijack
//!     argument: 10.0.0.5
//!     address:
//!       Specif:
//!         Domain:
//!           pattern: '\Ainternal\.example\.com\z'
//!   - action: Direct
//!     address:
//!       Specif:
//!         IpAddr:
//!           addr: 192.168.0.0
//!           prefix: 16
//! "#;
//! let acl: AclEngine = serde_yaml::from_str(yaml).unwrap();
//! let decision = acl.lookup(Some("internal.example.com"), None).unwrap();
//! assert_eq!(decision, AclDecision::new(Action::Hijack, "10.0.0.5"));
//! let decision = acl.lookup(None, Some("192.168.3.4".parse().unwrap())).unwrap();
//! assert_eq!(decision.action, Action::Direct);
//! ```
use std::fmt;
use std::fs::File;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use log::*;
use regex::{escape, Regex};
use serde::*;

use crate::error::Error;

static AVAILABLE_STRINGS_FOR_DOMAIN_LABEL: &str = r"[A-Za-z0-9-]{1,63}";

/// Routing action for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// dial the destination from this process
    Direct,
    /// dial through the tunnel
    Proxy,
    /// refuse without dialing
    Block,
    /// dial `argument:port` instead
    Hijack,
    Unknown(u8),
}

impl Action {
    pub fn code(&self) -> u8 {
        match self {
            Action::Direct => 0,
            Action::Proxy => 1,
            Action::Block => 2,
            Action::Hijack => 3,
            Action::Unknown(code) => *code,
        }
    }
}

impl From<u8> for Action {
    fn from(code: u8) -> Self {
        match code {
            0 => Action::Direct,
            1 => Action::Proxy,
            2 => Action::Block,
            3 => Action::Hijack,
            code => Action::Unknown(code),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Action::Unknown(code) => write!(f, "Unknown({})", code),
            action => write!(f, "{:?}", action),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AclDecision {
    pub action: Action,
    /// redirect target for `Hijack`, empty otherwise
    pub argument: String,
}

impl AclDecision {
    pub fn new<S: Into<String>>(action: Action, argument: S) -> Self {
        Self {
            action,
            argument: argument.into(),
        }
    }
}

impl From<Action> for AclDecision {
    fn from(action: Action) -> Self {
        AclDecision::new(action, "")
    }
}

impl fmt::Display for AclDecision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.argument.is_empty() {
            write!(f, "{}", self.action)
        } else {
            write!(f, "{}({})", self.action, self.argument)
        }
    }
}

/// ACL lookup capability.
///
/// `domain` is `None` whenever the destination is a literal ip address.
/// Returns `None` when nothing decides, leaving the choice to the caller's default.
pub trait AclLookup: fmt::Debug + Send + Sync {
    fn lookup(&self, domain: Option<&str>, ip: Option<IpAddr>) -> Option<AclDecision>;
}

/// No ACL configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAcl;

impl AclLookup for NoAcl {
    fn lookup(&self, _domain: Option<&str>, _ip: Option<IpAddr>) -> Option<AclDecision> {
        None
    }
}

/// Same action for every destination.
#[derive(Debug, Clone, Copy)]
pub struct FixedAction(pub Action);

impl AclLookup for FixedAction {
    fn lookup(&self, _domain: Option<&str>, _ip: Option<IpAddr>) -> Option<AclDecision> {
        Some(self.0.into())
    }
}

#[derive(Debug, Clone)]
pub enum AddressPattern {
    /// e.g. 127.0.0.1/16
    IpAddr { addr: IpAddr, prefix: u8 },
    Domain(DomainPattern),
}

#[derive(Debug, Clone)]
pub enum DomainPattern {
    Regex { pattern: Regex },
    /// `*` stands for exactly one label
    Wildcard { wildcard: String, compiled: Regex },
}

#[derive(thiserror::Error, Debug)]
pub enum InvalidPrefix {
    #[error("{prefix} is too large for {addr}")]
    V4 { addr: Ipv4Addr, prefix: u8 },
    #[error("{prefix} is too large for {addr}")]
    V6 { addr: Ipv6Addr, prefix: u8 },
}

impl de::Expected for InvalidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InvalidPrefix::*;
        match self {
            V4 { addr, prefix } => write!(f, "less than or equals to 32: {}/{}", addr, prefix),
            V6 { addr, prefix } => write!(f, "less than or equals to 128: {}/{}", addr, prefix),
        }
    }
}

impl AddressPattern {
    pub fn addr(addr: IpAddr, prefix: u8) -> Result<Self, InvalidPrefix> {
        match addr {
            IpAddr::V4(v4) if prefix > 32 => Err(InvalidPrefix::V4 { addr: v4, prefix }),
            IpAddr::V6(v6) if prefix > 128 => Err(InvalidPrefix::V6 { addr: v6, prefix }),
            addr => Ok(AddressPattern::IpAddr { addr, prefix }),
        }
    }

    pub fn wildcard(wildcard: &str) -> Result<Self, regex::Error> {
        let pattern = format!(
            r"(?i)\A{}\z",
            &escape(wildcard).replace(r"\*", AVAILABLE_STRINGS_FOR_DOMAIN_LABEL)
        );
        Ok(AddressPattern::Domain(DomainPattern::Wildcard {
            wildcard: wildcard.to_owned(),
            compiled: Regex::new(&pattern)?,
        }))
    }

    /// Domain patterns only see domains, ip patterns only ip addresses.
    pub fn r#match(&self, domain: Option<&str>, ip: Option<IpAddr>) -> bool {
        use AddressPattern as P;
        use DomainPattern as DP;
        match (self, domain, ip) {
            (
                P::IpAddr {
                    addr: IpAddr::V4(addrp),
                    prefix,
                },
                _,
                Some(IpAddr::V4(addr)),
            ) => {
                let bmask = u32::MAX.checked_shl(32 - *prefix as u32).unwrap_or(0);
                u32::from(*addrp) & bmask == u32::from(addr) & bmask
            }
            (
                P::IpAddr {
                    addr: IpAddr::V6(addrp),
                    prefix,
                },
                _,
                Some(IpAddr::V6(addr)),
            ) => {
                let bmask = u128::MAX.checked_shl(128 - *prefix as u32).unwrap_or(0);
                u128::from(*addrp) & bmask == u128::from(addr) & bmask
            }
            (P::Domain(DP::Regex { pattern }), Some(domain), _) => pattern.is_match(domain),
            (P::Domain(DP::Wildcard { compiled, .. }), Some(domain), _) => {
                compiled.is_match(domain)
            }
            _ => false,
        }
    }
}

impl From<Regex> for AddressPattern {
    fn from(reg: Regex) -> Self {
        AddressPattern::Domain(DomainPattern::Regex { pattern: reg })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RulePattern<P> {
    Any,
    Specif(P),
}

impl RulePattern<AddressPattern> {
    fn r#match(&self, domain: Option<&str>, ip: Option<IpAddr>) -> bool {
        match self {
            RulePattern::Any => true,
            RulePattern::Specif(pat) => pat.r#match(domain, ip),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AclRule {
    pub action: Action,
    #[serde(default)]
    pub argument: String,
    pub address: RulePattern<AddressPattern>,
}

impl AclRule {
    pub fn new<S: Into<String>>(
        action: Action,
        argument: S,
        address: RulePattern<AddressPattern>,
    ) -> Self {
        Self {
            action,
            argument: argument.into(),
            address,
        }
    }
}

/// Ordered rules, the first match wins.
///
/// When no rule matches, `fallback` decides if it is set.
#[derive(Debug, Clone, Default)]
pub struct AclEngine {
    rules: Vec<AclRule>,
    fallback: Option<Action>,
}

mod format {
    use super::*;
    use de::Unexpected;

    // dummy types for acquiring derived deserializers
    #[derive(Debug, Clone, Deserialize)]
    enum AddressPatternDef {
        IpAddr { addr: IpAddr, prefix: u8 },
        Domain(DomainPatternDef),
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(untagged)]
    enum DomainPatternDef {
        Regex {
            #[serde(with = "serde_regex")]
            pattern: Regex,
        },
        Wildcard {
            wildcard: String,
        },
    }

    impl<'de> Deserialize<'de> for AddressPattern {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            use AddressPatternDef::*;
            use DomainPatternDef::*;
            match AddressPatternDef::deserialize(deserializer)? {
                IpAddr { addr, prefix } => AddressPattern::addr(addr, prefix).map_err(|err| {
                    de::Error::invalid_value(Unexpected::Unsigned(prefix as u64), &err)
                }),
                Domain(Regex { pattern }) => Ok(pattern.into()),
                Domain(Wildcard { wildcard }) => {
                    AddressPattern::wildcard(&wildcard).map_err(de::Error::custom)
                }
            }
        }
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct AclEngineDef {
        #[serde(default)]
        fallback: Option<Action>,
        #[serde(default)]
        rules: Vec<AclRule>,
    }

    impl<'de> Deserialize<'de> for AclEngine {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let AclEngineDef { fallback, rules } = AclEngineDef::deserialize(deserializer)?;
            if let Some(rule) = rules
                .iter()
                .find(|rule| rule.action == Action::Hijack && rule.argument.is_empty())
            {
                return Err(de::Error::custom(format!(
                    "Hijack rule without argument: {:?}",
                    rule.address
                )));
            }
            if fallback == Some(Action::Hijack) {
                return Err(de::Error::custom("fallback can not be Hijack"));
            }
            Ok(AclEngine { rules, fallback })
        }
    }

}

impl AclEngine {
    pub fn new(rules: Vec<AclRule>, fallback: Option<Action>) -> Self {
        Self { rules, fallback }
    }

    /// Load rules from a yaml file.
    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path.as_ref())?;
        let engine: AclEngine = serde_yaml::from_reader(file)?;
        info!(
            "loaded {} acl rules from {}",
            engine.rules.len(),
            path.as_ref().display()
        );
        Ok(engine)
    }

    pub fn push(&mut self, rule: AclRule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    pub fn set_fallback(&mut self, fallback: Option<Action>) -> &mut Self {
        self.fallback = fallback;
        self
    }
}

impl AclLookup for AclEngine {
    fn lookup(&self, domain: Option<&str>, ip: Option<IpAddr>) -> Option<AclDecision> {
        for rule in &self.rules {
            if rule.address.r#match(domain, ip) {
                trace!("match({}): {:?}: {:?}/{:?}", rule.action, rule.address, domain, ip);
                return Some(AclDecision::new(rule.action, rule.argument.clone()));
            }
        }
        self.fallback.map(Into::into)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use RulePattern::*;

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn action_codes() {
        for code in 0..=255u8 {
            assert_eq!(Action::from(code).code(), code);
        }
        assert_eq!(Action::from(3), Action::Hijack);
        assert_eq!(Action::from(9), Action::Unknown(9));
    }

    #[test]
    fn first_match_wins() {
        let mut acl = AclEngine::default();
        acl.push(AclRule::new(
            Action::Block,
            "",
            Specif(AddressPattern::wildcard("ads.example.com").unwrap()),
        ))
        .push(AclRule::new(
            Action::Direct,
            "",
            Specif(Regex::new(r"(.*\.)?example\.com\z").unwrap().into()),
        ))
        .push(AclRule::new(Action::Proxy, "", Any));

        assert_eq!(
            acl.lookup(Some("ads.example.com"), None).unwrap().action,
            Action::Block
        );
        assert_eq!(
            acl.lookup(Some("www.example.com"), None).unwrap().action,
            Action::Direct
        );
        assert_eq!(
            acl.lookup(Some("example.org"), None).unwrap().action,
            Action::Proxy
        );
        assert_eq!(
            acl.lookup(None, ip("1.2.3.4")).unwrap().action,
            Action::Proxy
        );
    }

    #[test]
    fn fallback_or_nothing() {
        let mut acl = AclEngine::default();
        acl.push(AclRule::new(
            Action::Block,
            "",
            Specif(AddressPattern::wildcard("*.ads.example.com").unwrap()),
        ));
        assert_eq!(acl.lookup(Some("example.com"), None), None);
        acl.set_fallback(Some(Action::Direct));
        assert_eq!(
            acl.lookup(Some("example.com"), None),
            Some(Action::Direct.into())
        );
    }

    #[test]
    fn domain_patterns_never_match_ip() {
        let mut acl = AclEngine::default();
        acl.push(AclRule::new(
            Action::Block,
            "",
            Specif(Regex::new(r".*").unwrap().into()),
        ));
        acl.push(AclRule::new(
            Action::Direct,
            "",
            Specif(AddressPattern::addr("10.0.0.0".parse().unwrap(), 8).unwrap()),
        ));
        assert_eq!(acl.lookup(None, ip("10.1.2.3")).unwrap().action, Action::Direct);
        assert_eq!(acl.lookup(None, ip("11.1.2.3")), None);
        // ip patterns never match domains
        let mut acl = AclEngine::default();
        acl.push(AclRule::new(
            Action::Direct,
            "",
            Specif(AddressPattern::addr("0.0.0.0".parse().unwrap(), 0).unwrap()),
        ));
        assert_eq!(acl.lookup(Some("example.com"), None), None);
        assert_eq!(acl.lookup(None, ip("8.8.8.8")).unwrap().action, Action::Direct);
        assert_eq!(acl.lookup(None, ip("::1")), None);
    }

    #[test]
    fn domain_wildcard() {
        let cases = vec![
            (
                "*.*.example.com",
                vec!["b.a.example.com", "B.A.Example.com"],
                vec!["example.com", "a.example.com", "c.b.a.example.com"],
            ),
            (
                "fo*.b*r.*az.example.com",
                vec!["foo.bar.baz.example.com"],
                vec![
                    "fuu.bar.baz.example.com",
                    "foo.var.baz.example.com",
                    "foo.bar.buz.example.com",
                ],
            ),
            (
                "*.execute-api.*-east-*.amazonaws.com",
                vec![
                    "foo.execute-api.us-east-1.amazonaws.com",
                    "foo.execute-api.us-east-2.amazonaws.com",
                ],
                vec![
                    "foo.execute-api.us-west-1.amazonaws.com",
                    "foo.execute-api.ap-northeast-1.amazonaws.com",
                ],
            ),
        ];
        for (wildcard, matches, unmatches) in cases {
            let pat = AddressPattern::wildcard(wildcard).unwrap();
            for domain in matches {
                assert!(pat.r#match(Some(domain), None), "{} {}", wildcard, domain);
            }
            for domain in unmatches {
                assert!(!pat.r#match(Some(domain), None), "{} {}", wildcard, domain);
            }
        }
    }

    #[test]
    fn ip_prefixes() {
        let pat = AddressPattern::addr("192.168.0.1".parse().unwrap(), 24).unwrap();
        assert!(pat.r#match(None, ip("192.168.0.255")));
        assert!(!pat.r#match(None, ip("192.168.1.2")));
        let pat = AddressPattern::addr("ff01::0".parse().unwrap(), 32).unwrap();
        assert!(pat.r#match(None, ip("ff01::1")));
        assert!(!pat.r#match(None, ip("ffff::1")));
        assert!(!pat.r#match(None, ip("255.1.0.0")));
        assert!(AddressPattern::addr("::".parse().unwrap(), 129).is_err());
    }

    #[test]
    fn lookup_is_deterministic() {
        let acl: AclEngine = serde_yaml::from_str(
            r#"
fallback: Direct
rules:
  - action: Hijack
    argument: 10.0.0.5
    address:
      Specif:
        Domain:
          wildcard: internal.example.com
"#,
        )
        .unwrap();
        let first = acl.lookup(Some("internal.example.com"), None);
        for _ in 0..10 {
            assert_eq!(acl.lookup(Some("internal.example.com"), None), first);
        }
        assert_eq!(first, Some(AclDecision::new(Action::Hijack, "10.0.0.5")));
    }

    #[test]
    fn example_acl() {
        use std::path::Path;
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("acl.example.yml");
        let acl = AclEngine::with_file(path).unwrap();
        assert_eq!(
            acl.lookup(Some("ads.example.com"), None).unwrap().action,
            Action::Block
        );
        assert_eq!(
            acl.lookup(Some("internal.example.com"), None),
            Some(AclDecision::new(Action::Hijack, "10.0.0.5"))
        );
    }
}
