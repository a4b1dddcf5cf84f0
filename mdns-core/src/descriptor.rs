use std::net::IpAddr;

use crate::state::StateMachine;

/// A service registered by this host, e.g. `_http._tcp.local` instance
/// `printer`. The qualified name is `name.service_type`, compared
/// case-insensitively.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub service_type: String,
    pub name: String,
    pub server: String,
    pub port: u16,
    pub weight: u16,
    pub priority: u16,
    pub text: Vec<u8>,
    pub address: Option<IpAddr>,
    pub persistent: bool,
    pub state: StateMachine,
    /// Set when a TXT update arrives after ANNOUNCED, so the next scheduler
    /// pass knows to re-enter ANNOUNCING instead of treating the descriptor
    /// as idle.
    pub needs_text_announcement: bool,
}

impl ServiceDescriptor {
    pub fn new(service_type: impl Into<String>, name: impl Into<String>, server: impl Into<String>, port: u16) -> Self {
        Self {
            service_type: service_type.into(),
            name: name.into(),
            server: server.into(),
            port,
            weight: 0,
            priority: 0,
            text: Vec::new(),
            address: None,
            persistent: false,
            state: StateMachine::default(),
            needs_text_announcement: false,
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.name, self.service_type).to_ascii_lowercase()
    }

    pub fn has_data(&self) -> bool {
        self.address.is_some()
    }

    /// Setting TXT on an announced descriptor moves it back to ANNOUNCING_1
    /// so the new value gets re-advertised; a descriptor still probing or
    /// announcing just picks up the new bytes on its next pass.
    pub fn set_text(&mut self, text: Vec<u8>) {
        self.text = text;
        if self.state.current().is_announced() {
            self.needs_text_announcement = true;
        }
    }
}

/// The host's own `.local` identity: the name that A/AAAA records for this
/// machine are published under.
#[derive(Debug, Clone)]
pub struct HostDescriptor {
    pub base_name: String,
    pub suffix: u32,
    pub address: Option<IpAddr>,
    pub state: StateMachine,
}

impl HostDescriptor {
    pub fn new(base_name: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
            suffix: 0,
            address: None,
            state: StateMachine::default(),
        }
    }

    /// Current `.local` name, including any collision-rename suffix.
    pub fn name(&self) -> String {
        if self.suffix == 0 {
            self.base_name.clone()
        } else {
            let trimmed = self.base_name.trim_end_matches(".local");
            format!("{trimmed}-{}.local", self.suffix)
        }
    }

    /// Bump the collision suffix and restart probing, per the tie-break loss
    /// rule in record conflict handling.
    pub fn rename(&mut self) {
        self.suffix += 1;
        self.state.revert();
    }
}

/// Bumps a service instance name on probe loss: `printer` -> `printer (2)`.
pub fn rename_service_instance(name: &str) -> String {
    match name.rsplit_once(" (") {
        Some((base, rest)) if rest.ends_with(')') => {
            let n: u32 = rest.trim_end_matches(')').parse().unwrap_or(1);
            format!("{base} ({})", n + 1)
        }
        _ => format!("{name} (2)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_build_qualified_name_lowercased() {
        let descriptor = ServiceDescriptor::new("_HTTP._tcp.local", "Printer", "host.local", 80);
        assert_eq!(descriptor.qualified_name(), "printer._http._tcp.local");
    }

    #[test]
    fn should_request_text_reannouncement_only_when_announced() {
        let mut descriptor = ServiceDescriptor::new("_http._tcp.local", "printer", "host.local", 80);
        descriptor.set_text(b"rp=queue1".to_vec());
        assert!(!descriptor.needs_text_announcement);

        for _ in 0..5 {
            descriptor.state.advance();
        }
        descriptor.set_text(b"rp=queue2".to_vec());
        assert!(descriptor.needs_text_announcement);
    }

    #[test]
    fn should_rename_host_and_revert_to_probing() {
        let mut host = HostDescriptor::new("foo.local");
        for _ in 0..5 {
            host.state.advance();
        }
        host.rename();
        assert_eq!(host.name(), "foo-1.local");
        assert_eq!(host.state.current(), crate::state::State::Probing1);
    }

    #[test]
    fn should_rename_service_instance_incrementally() {
        assert_eq!(rename_service_instance("printer"), "printer (2)");
        assert_eq!(rename_service_instance("printer (2)"), "printer (3)");
    }
}
