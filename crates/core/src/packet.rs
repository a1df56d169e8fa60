#![forbid(unsafe_code)]

use crate::ids::NodeId;

pub const PACKET_EXT: &str = "zip";
pub const PACKET_TMP_EXT: &str = "tmp";

/// Parsed form of `<team>.<job>.<run>.<node>.<ticks>.zip`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketName {
    pub team: String,
    pub job_id: String,
    pub run_name: String,
    pub node_id: NodeId,
    pub ticks: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketNameError(pub String);

impl std::fmt::Display for PacketNameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid packet name: {}", self.0)
    }
}

impl std::error::Error for PacketNameError {}

impl PacketName {
    pub fn file_name(&self) -> String {
        format!("{}.{PACKET_EXT}", self.stem())
    }

    pub fn stem(&self) -> String {
        format!(
            "{}.{}.{}.{}.{}",
            self.team, self.job_id, self.run_name, self.node_id, self.ticks
        )
    }

    /// Run names may contain dots (`run3.1`), so the fixed fields are taken
    /// from both ends and the run name is whatever remains in the middle.
    pub fn parse(file_name: &str) -> Result<Self, PacketNameError> {
        let err = || PacketNameError(file_name.to_string());
        let stem = file_name
            .strip_suffix(&format!(".{PACKET_EXT}"))
            .ok_or_else(err)?;
        let parts = stem.split('.').collect::<Vec<_>>();
        if parts.len() < 5 {
            return Err(err());
        }
        let team = parts[0];
        let job_id = parts[1];
        let ticks = parts[parts.len() - 1].parse::<i64>().map_err(|_| err())?;
        let node_id = NodeId::parse(parts[parts.len() - 2]).map_err(|_| err())?;
        let run_name = parts[2..parts.len() - 2].join(".");
        if team.is_empty() || job_id.is_empty() || run_name.is_empty() {
            return Err(err());
        }
        Ok(Self {
            team: team.to_string(),
            job_id: job_id.to_string(),
            run_name,
            node_id,
            ticks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_run_names() {
        let name = PacketName::parse("tpx.job4.run7.2.node1.17000001.zip").expect("packet");
        assert_eq!(name.team, "tpx");
        assert_eq!(name.job_id, "job4");
        assert_eq!(name.run_name, "run7.2");
        assert_eq!(name.node_id.index(), 1);
        assert_eq!(name.ticks, 17000001);
        assert_eq!(name.file_name(), "tpx.job4.run7.2.node1.17000001.zip");
    }

    #[test]
    fn rejects_partial_and_tmp_files() {
        assert!(PacketName::parse("tpx.job4.run7.node1.1000.tmp").is_err());
        assert!(PacketName::parse("tpx.job4.node1.1000.zip").is_err());
        assert!(PacketName::parse("tpx.job4.run7.nodeX.1000.zip").is_err());
    }
}
