//! Service categories and their legend colors on the map.

use std::fmt;

/// Traffic category shown in the map legend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceCategory {
    Ftp,
    Ssh,
    Telnet,
    Email,
    Sql,
    Dns,
    Http,
    Https,
    Vnc,
    Snmp,
    Smb,
    Medical,
    Rdp,
    Sip,
    Adb,
    Other,
}

impl ServiceCategory {
    /// Every category, in legend order.
    pub const ALL: [ServiceCategory; 16] = [
        Self::Ftp,
        Self::Ssh,
        Self::Telnet,
        Self::Email,
        Self::Sql,
        Self::Dns,
        Self::Http,
        Self::Https,
        Self::Vnc,
        Self::Snmp,
        Self::Smb,
        Self::Medical,
        Self::Rdp,
        Self::Sip,
        Self::Adb,
        Self::Other,
    ];

    /// Legend label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ftp => "FTP",
            Self::Ssh => "SSH",
            Self::Telnet => "TELNET",
            Self::Email => "EMAIL",
            Self::Sql => "SQL",
            Self::Dns => "DNS",
            Self::Http => "HTTP",
            Self::Https => "HTTPS",
            Self::Vnc => "VNC",
            Self::Snmp => "SNMP",
            Self::Smb => "SMB",
            Self::Medical => "MEDICAL",
            Self::Rdp => "RDP",
            Self::Sip => "SIP",
            Self::Adb => "ADB",
            Self::Other => "OTHER",
        }
    }

    /// Hex color the renderer uses for this category.
    pub fn color(&self) -> &'static str {
        match self {
            Self::Ftp => "#ff0000",
            Self::Ssh => "#ff8000",
            Self::Telnet => "#ffff00",
            Self::Email => "#80ff00",
            Self::Sql => "#00ff00",
            Self::Dns => "#00ff80",
            Self::Http => "#00ffff",
            Self::Https => "#0080ff",
            Self::Vnc => "#0000ff",
            Self::Snmp => "#8000ff",
            Self::Smb => "#bf00ff",
            Self::Medical => "#ff00ff",
            Self::Rdp => "#ff0060",
            Self::Sip => "#ffccff",
            Self::Adb => "#ffcccc",
            Self::Other => "#ffffff",
        }
    }

    /// Match a protocol name against the legend labels (case-insensitive).
    pub fn from_protocol(protocol: &str) -> Option<Self> {
        let protocol = protocol.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(protocol))
    }

    /// Well-known destination ports.
    pub fn from_port(port: u16) -> Self {
        match port {
            20 | 21 => Self::Ftp,
            22 => Self::Ssh,
            23 | 2323 => Self::Telnet,
            25 | 110 | 143 | 465 | 587 | 993 | 995 => Self::Email,
            1433 | 1521 | 3306 | 5432 | 27017 => Self::Sql,
            53 => Self::Dns,
            80 | 8000 | 8080 => Self::Http,
            443 | 8443 => Self::Https,
            5900 | 5901 => Self::Vnc,
            161 | 162 => Self::Snmp,
            139 | 445 => Self::Smb,
            104 | 2575 | 11112 => Self::Medical,
            3389 => Self::Rdp,
            5060 | 5061 => Self::Sip,
            5555 => Self::Adb,
            _ => Self::Other,
        }
    }

    /// Category for an event: the protocol name wins, the port is the fallback.
    pub fn classify(protocol: &str, dst_port: u16) -> Self {
        Self::from_protocol(protocol).unwrap_or_else(|| Self::from_port(dst_port))
    }
}

impl fmt::Display for ServiceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
