use std::io::{BufRead, BufReader, Read, Write};
use std::net::SocketAddr;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Role of a member inside the group. `Normal` and `Standby` members
/// count toward the consensus majority; observers replicate without
/// voting, and a restoring member is still receiving a snapshot and
/// votes only once promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Normal,
    Standby,
    Observer,
    Restoring,
}

impl MemberRole {
    pub fn is_consensus(self) -> bool {
        matches!(self, MemberRole::Normal | MemberRole::Standby)
    }

    pub fn to_u8(self) -> u8 {
        match self {
            MemberRole::Normal => 1,
            MemberRole::Standby => 2,
            MemberRole::Observer => 3,
            MemberRole::Restoring => 4,
        }
    }

    pub fn from_u8(v: u8) -> Option<MemberRole> {
        match v {
            1 => Some(MemberRole::Normal),
            2 => Some(MemberRole::Standby),
            3 => Some(MemberRole::Observer),
            4 => Some(MemberRole::Restoring),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: u64,
    pub addr: SocketAddr,
    pub role: MemberRole,
}

/// A membership change riding the log stream. The version is the group
/// version the change produces when applied; stale versions are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Join {
        version: u64,
        id: u64,
        addr: SocketAddr,
        role: MemberRole,
    },
    UpdateRole {
        version: u64,
        id: u64,
        role: MemberRole,
    },
    Remove {
        version: u64,
        id: u64,
    },
}

impl ControlMessage {
    pub fn version(&self) -> u64 {
        match self {
            ControlMessage::Join { version, .. }
            | ControlMessage::UpdateRole { version, .. }
            | ControlMessage::Remove { version, .. } => *version,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let line = match self {
            ControlMessage::Join {
                version,
                id,
                addr,
                role,
            } => format!("join {version} {id} {addr} {}", role.to_u8()),
            ControlMessage::UpdateRole { version, id, role } => {
                format!("role {version} {id} {}", role.to_u8())
            }
            ControlMessage::Remove { version, id } => format!("remove {version} {id}"),
        };
        line.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<ControlMessage> {
        let line = std::str::from_utf8(bytes)
            .map_err(|_| Error::Protocol("control message is not utf8"))?;
        let mut parts = line.split_whitespace();
        let kind = parts.next().ok_or(Error::Protocol("empty control message"))?;
        let mut next_u64 = |parts: &mut std::str::SplitWhitespace| -> Result<u64> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or(Error::Protocol("bad control message field"))
        };
        match kind {
            "join" => {
                let version = next_u64(&mut parts)?;
                let id = next_u64(&mut parts)?;
                let addr = parts
                    .next()
                    .and_then(|p| p.parse().ok())
                    .ok_or(Error::Protocol("bad control message address"))?;
                let role = next_u64(&mut parts)? as u8;
                Ok(ControlMessage::Join {
                    version,
                    id,
                    addr,
                    role: MemberRole::from_u8(role)
                        .ok_or(Error::Protocol("bad control message role"))?,
                })
            }
            "role" => {
                let version = next_u64(&mut parts)?;
                let id = next_u64(&mut parts)?;
                let role = next_u64(&mut parts)? as u8;
                Ok(ControlMessage::UpdateRole {
                    version,
                    id,
                    role: MemberRole::from_u8(role)
                        .ok_or(Error::Protocol("bad control message role"))?,
                })
            }
            "remove" => Ok(ControlMessage::Remove {
                version: next_u64(&mut parts)?,
                id: next_u64(&mut parts)?,
            }),
            _ => Err(Error::Protocol("unknown control message")),
        }
    }
}

/// The group membership collaborator. The on-disk format and the join
/// handshake live outside the core; this is the surface the core calls.
pub trait GroupMembership: Send + Sync + 'static {
    fn version(&self) -> u64;
    fn group_id(&self) -> u64;
    fn local_member_id(&self) -> u64;
    fn local_role(&self) -> MemberRole;
    /// Every member of the group, the local one included.
    fn members(&self) -> Vec<MemberInfo>;

    fn propose_join(&self, id: u64, addr: SocketAddr, role: MemberRole) -> ControlMessage;
    fn propose_update_role(&self, id: u64, role: MemberRole) -> ControlMessage;
    fn propose_remove(&self, id: u64) -> ControlMessage;

    /// Applies a committed control message; returns whether the group
    /// version advanced.
    fn apply(&self, msg: &ControlMessage) -> bool;

    fn write_to(&self, w: &mut dyn Write) -> std::io::Result<()>;
    fn read_from(&self, r: &mut dyn Read) -> std::io::Result<bool>;
}

struct GroupState {
    version: u64,
    members: Vec<MemberInfo>,
}

/// Process-local membership. Serializes as a versioned properties
/// stream, which is also what `GROUP_FILE` carries on the wire.
pub struct StaticMembership {
    group_id: u64,
    local_id: u64,
    state: Mutex<GroupState>,
}

impl StaticMembership {
    pub fn new(group_id: u64, local_id: u64, members: Vec<MemberInfo>) -> StaticMembership {
        StaticMembership {
            group_id,
            local_id,
            state: Mutex::new(GroupState {
                version: 1,
                members,
            }),
        }
    }
}

impl GroupMembership for StaticMembership {
    fn version(&self) -> u64 {
        self.state.lock().version
    }

    fn group_id(&self) -> u64 {
        self.group_id
    }

    fn local_member_id(&self) -> u64 {
        self.local_id
    }

    fn local_role(&self) -> MemberRole {
        self.state
            .lock()
            .members
            .iter()
            .find(|m| m.id == self.local_id)
            .map(|m| m.role)
            .unwrap_or(MemberRole::Observer)
    }

    fn members(&self) -> Vec<MemberInfo> {
        self.state.lock().members.clone()
    }

    fn propose_join(&self, id: u64, addr: SocketAddr, role: MemberRole) -> ControlMessage {
        ControlMessage::Join {
            version: self.version() + 1,
            id,
            addr,
            role,
        }
    }

    fn propose_update_role(&self, id: u64, role: MemberRole) -> ControlMessage {
        ControlMessage::UpdateRole {
            version: self.version() + 1,
            id,
            role,
        }
    }

    fn propose_remove(&self, id: u64) -> ControlMessage {
        ControlMessage::Remove {
            version: self.version() + 1,
            id,
        }
    }

    fn apply(&self, msg: &ControlMessage) -> bool {
        let mut state = self.state.lock();
        if msg.version() != state.version + 1 {
            tracing::debug!(
                current = state.version,
                proposed = msg.version(),
                "stale control message ignored"
            );
            return false;
        }
        match msg {
            ControlMessage::Join {
                id, addr, role, ..
            } => {
                if state.members.iter().any(|m| m.id == *id) {
                    return false;
                }
                state.members.push(MemberInfo {
                    id: *id,
                    addr: *addr,
                    role: *role,
                });
            }
            ControlMessage::UpdateRole { id, role, .. } => {
                let Some(member) = state.members.iter_mut().find(|m| m.id == *id) else {
                    return false;
                };
                member.role = *role;
            }
            ControlMessage::Remove { id, .. } => {
                let before = state.members.len();
                state.members.retain(|m| m.id != *id);
                if state.members.len() == before {
                    return false;
                }
            }
        }
        state.version = msg.version();
        true
    }

    fn write_to(&self, w: &mut dyn Write) -> std::io::Result<()> {
        let state = self.state.lock();
        writeln!(w, "version = {}", state.version)?;
        writeln!(w, "groupId = {}", self.group_id)?;
        for m in &state.members {
            writeln!(w, "member.{} = {} | {}", m.id, m.addr, m.role.to_u8())?;
        }
        Ok(())
    }

    fn read_from(&self, r: &mut dyn Read) -> std::io::Result<bool> {
        let reader = BufReader::new(r);
        let mut version = 0u64;
        let mut members = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key == "version" {
                version = value.parse().map_err(bad_data)?;
            } else if let Some(id) = key.strip_prefix("member.") {
                let id: u64 = id.parse().map_err(bad_data)?;
                let (addr, role) = value.split_once('|').ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "bad member line")
                })?;
                let addr: SocketAddr = addr.trim().parse().map_err(bad_data)?;
                let role = role
                    .trim()
                    .parse::<u8>()
                    .ok()
                    .and_then(MemberRole::from_u8)
                    .ok_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::InvalidData, "bad member role")
                    })?;
                members.push(MemberInfo { id, addr, role });
            }
        }

        let mut state = self.state.lock();
        if version <= state.version {
            return Ok(false);
        }
        state.version = version;
        state.members = members;
        Ok(true)
    }
}

fn bad_data<E: std::error::Error + Send + Sync + 'static>(e: E) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod test {
    use super::*;

    fn member(id: u64, role: MemberRole) -> MemberInfo {
        MemberInfo {
            id,
            addr: format!("127.0.0.1:{}", 7000 + id).parse().unwrap(),
            role,
        }
    }

    #[test]
    fn control_message_round_trip() {
        let msgs = [
            ControlMessage::Join {
                version: 2,
                id: 4,
                addr: "10.0.0.4:7004".parse().unwrap(),
                role: MemberRole::Observer,
            },
            ControlMessage::Join {
                version: 2,
                id: 5,
                addr: "10.0.0.5:7005".parse().unwrap(),
                role: MemberRole::Restoring,
            },
            ControlMessage::UpdateRole {
                version: 3,
                id: 4,
                role: MemberRole::Normal,
            },
            ControlMessage::Remove { version: 4, id: 4 },
        ];
        for msg in msgs {
            assert_eq!(ControlMessage::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn apply_enforces_version_order() {
        let group = StaticMembership::new(
            1,
            1,
            vec![member(1, MemberRole::Normal), member(2, MemberRole::Normal)],
        );
        assert_eq!(group.version(), 1);

        let join =
            group.propose_join(3, member(3, MemberRole::Restoring).addr, MemberRole::Restoring);
        assert!(group.apply(&join));
        assert_eq!(group.version(), 2);
        // replay is ignored
        assert!(!group.apply(&join));
        // a restoring member does not vote until promoted
        assert_eq!(
            group
                .members()
                .iter()
                .filter(|m| m.role.is_consensus())
                .count(),
            2
        );

        let update = group.propose_update_role(3, MemberRole::Normal);
        assert!(group.apply(&update));
        assert_eq!(
            group
                .members()
                .iter()
                .filter(|m| m.role.is_consensus())
                .count(),
            3
        );

        let remove = group.propose_remove(3);
        assert!(group.apply(&remove));
        assert_eq!(group.members().len(), 2);
    }

    #[test]
    fn properties_stream_round_trip() {
        let group = StaticMembership::new(
            9,
            1,
            vec![member(1, MemberRole::Normal), member(2, MemberRole::Observer)],
        );
        group.apply(&group.propose_update_role(2, MemberRole::Normal));

        let mut buf = Vec::new();
        group.write_to(&mut buf).unwrap();

        let other = StaticMembership::new(9, 2, vec![member(2, MemberRole::Observer)]);
        assert!(other.read_from(&mut buf.as_slice()).unwrap());
        assert_eq!(other.version(), group.version());
        assert_eq!(other.members(), group.members());
        // stale stream does not regress
        assert!(!other.read_from(&mut buf.as_slice()).unwrap());
    }
}
