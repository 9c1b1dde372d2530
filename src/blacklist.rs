// Short-term exclusion of upstreams that failed to connect.
use crate::selector::UpstreamDirective;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Tracks upstream directives that recently refused or timed out, so the
/// selector can skip them for the cooldown period. Entries expire lazily.
///
/// DIRECT is never blacklisted: there is no alternative to fall back to and
/// no proxy endpoint to key the entry on.
pub struct Blacklist {
    cooldown: Duration,
    entries: Mutex<HashMap<UpstreamDirective, Instant>>,
}

impl Blacklist {
    pub fn new(cooldown: Duration) -> Self {
        Blacklist {
            cooldown,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a connect failure; the directive stays excluded until
    /// now + cooldown. Authentication failures must not end up here.
    pub fn mark_bad(&self, directive: &UpstreamDirective) {
        if matches!(directive, UpstreamDirective::Direct) {
            return;
        }
        let expiry = Instant::now() + self.cooldown;
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracing::debug!("Blacklisting {} for {:?}", directive, self.cooldown);
        entries.insert(directive.clone(), expiry);
    }

    /// Active entry check; expired entries are removed on the way.
    pub fn is_bad(&self, directive: &UpstreamDirective) -> bool {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.get(directive) {
            Some(expiry) if Instant::now() < *expiry => true,
            Some(_) => {
                entries.remove(directive);
                false
            }
            None => false,
        }
    }

    #[cfg(test)]
    fn active_count(&self) -> usize {
        let entries = self.entries.lock().unwrap();
        let now = Instant::now();
        entries.values().filter(|expiry| now < **expiry).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(host: &str) -> UpstreamDirective {
        UpstreamDirective::Http {
            host: host.to_string(),
            port: 8080,
        }
    }

    #[test]
    fn marked_directive_is_bad_until_expiry() {
        let blacklist = Blacklist::new(Duration::from_millis(50));
        let directive = http("dead");

        assert!(!blacklist.is_bad(&directive));
        blacklist.mark_bad(&directive);
        assert!(blacklist.is_bad(&directive));

        std::thread::sleep(Duration::from_millis(70));
        assert!(!blacklist.is_bad(&directive));
        assert_eq!(blacklist.active_count(), 0);
    }

    #[test]
    fn direct_is_never_blacklisted() {
        let blacklist = Blacklist::new(Duration::from_secs(60));
        blacklist.mark_bad(&UpstreamDirective::Direct);
        assert!(!blacklist.is_bad(&UpstreamDirective::Direct));
    }

    #[test]
    fn entries_are_keyed_by_kind_and_endpoint() {
        let blacklist = Blacklist::new(Duration::from_secs(60));
        blacklist.mark_bad(&http("gw"));
        assert!(blacklist.is_bad(&http("gw")));
        assert!(!blacklist.is_bad(&http("other")));
        assert!(!blacklist.is_bad(&UpstreamDirective::Socks5 {
            host: "gw".to_string(),
            port: 8080,
        }));
    }
}
