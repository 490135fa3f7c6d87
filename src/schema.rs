// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{self, Decode, DecodeError, Encode, EncodeError},
    CompressionType,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    io::{Read, Write},
    sync::Arc,
};

/// Identifies a table revision: id plus schema generation
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct TableIdentifier {
    /// Table id, stable for the table's lifetime
    pub id: Arc<str>,

    /// Schema generation, strictly increasing on structural change
    pub generation: u32,
}

impl TableIdentifier {
    /// Creates a new table identifier.
    pub fn new(id: &str, generation: u32) -> Self {
        Self {
            id: id.into(),
            generation,
        }
    }
}

impl std::fmt::Display for TableIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.id, self.generation)
    }
}

impl Encode for TableIdentifier {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        coding::encode_vstr16(writer, self.id.as_bytes())?;
        writer.write_u32::<BigEndian>(self.generation)?;
        Ok(())
    }
}

impl Decode for TableIdentifier {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let id = coding::decode_vstr16(reader)?;
        let id = std::str::from_utf8(&id)
            .map_err(|_| DecodeError::InvalidHeader("TableIdentifier"))?;
        let generation = reader.read_u32::<BigEndian>()?;
        Ok(Self::new(id, generation))
    }
}

/// One column family definition
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ColumnFamily {
    /// Integer code, unique and stable once assigned
    pub id: u8,

    /// Family name
    pub name: String,

    /// Name of the access group the family belongs to
    pub access_group: String,

    /// Maximum number of versions a scan returns, 0 = unlimited
    pub max_versions: u32,

    /// Time-to-live in seconds, 0 = forever
    pub ttl_secs: u32,

    /// Whether the family holds atomic counters
    pub counter: bool,
}

/// One access group: column families stored together on disk
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccessGroupSpec {
    /// Access group name
    pub name: String,

    /// Keep cell stores resident in memory
    pub in_memory: bool,

    /// Target uncompressed size of cell store blocks
    pub blocksize: u32,

    /// Codec used for cell store blocks
    pub compressor: CompressionType,

    /// Bloom filter mode for cell stores
    pub bloom_mode: crate::cell_store::BloomMode,
}

impl AccessGroupSpec {
    fn with_name(name: &str) -> Self {
        Self {
            name: name.into(),
            in_memory: false,
            blocksize: 65_536,
            compressor: CompressionType::Zlib,
            bloom_mode: crate::cell_store::BloomMode::Rows,
        }
    }
}

/// A table schema: generation, access groups and column families
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Schema {
    /// Table id the schema belongs to
    pub table_id: Arc<str>,

    /// Schema generation
    pub generation: u32,

    /// Access groups, at least one
    pub access_groups: Vec<AccessGroupSpec>,

    /// Column families across all access groups
    pub column_families: Vec<ColumnFamily>,

    /// Group commit interval in milliseconds, 0 = commit every tick
    pub group_commit_interval_ms: u32,
}

impl Schema {
    /// Builds a minimal schema: one entry per `(access group, families)` pair,
    /// family ids assigned in order starting at 1, generation 1.
    ///
    /// Intended for tests and bootstrap of the METADATA table.
    pub fn parse_simple(table_id: &str, groups: &[(&str, &[&str])]) -> crate::Result<Self> {
        let mut access_groups = Vec::new();
        let mut column_families = Vec::new();
        let mut next_id = 1u8;

        for (ag_name, families) in groups {
            access_groups.push(AccessGroupSpec::with_name(ag_name));

            for family in *families {
                column_families.push(ColumnFamily {
                    id: next_id,
                    name: (*family).into(),
                    access_group: (*ag_name).into(),
                    max_versions: 0,
                    ttl_secs: 0,
                    counter: false,
                });
                next_id = next_id
                    .checked_add(1)
                    .ok_or_else(|| crate::Error::BadSchema("too many column families".into()))?;
            }
        }

        let schema = Self {
            table_id: table_id.into(),
            generation: 1,
            access_groups,
            column_families,
            group_commit_interval_ms: 0,
        };
        schema.validate()?;

        Ok(schema)
    }

    /// Checks structural invariants: at least one access group, unique family
    /// ids and names, every family mapped to an existing access group.
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error::BadSchema;

        if self.access_groups.is_empty() {
            return Err(BadSchema("no access groups".into()));
        }

        let mut seen_ids = [false; 256];
        for cf in &self.column_families {
            if cf.id == 0 {
                return Err(BadSchema(format!("family {:?} has reserved id 0", cf.name)));
            }
            if seen_ids[usize::from(cf.id)] {
                return Err(BadSchema(format!("duplicate family id {}", cf.id)));
            }
            seen_ids[usize::from(cf.id)] = true;

            if !self.access_groups.iter().any(|ag| ag.name == cf.access_group) {
                return Err(BadSchema(format!(
                    "family {:?} names unknown access group {:?}",
                    cf.name, cf.access_group
                )));
            }
        }

        Ok(())
    }

    /// Looks up a column family by id.
    #[must_use]
    pub fn family(&self, id: u8) -> Option<&ColumnFamily> {
        self.column_families.iter().find(|cf| cf.id == id)
    }

    /// Looks up a column family by name.
    #[must_use]
    pub fn family_by_name(&self, name: &str) -> Option<&ColumnFamily> {
        self.column_families.iter().find(|cf| cf.name == name)
    }

    /// Returns the access group a family id belongs to.
    #[must_use]
    pub fn access_group_of(&self, family_id: u8) -> Option<&AccessGroupSpec> {
        let cf = self.family(family_id)?;
        self.access_groups.iter().find(|ag| ag.name == cf.access_group)
    }

    /// Returns the family ids belonging to an access group.
    #[must_use]
    pub fn families_of(&self, access_group: &str) -> Vec<u8> {
        self.column_families
            .iter()
            .filter(|cf| cf.access_group == access_group)
            .map(|cf| cf.id)
            .collect()
    }
}

impl Encode for Schema {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        coding::encode_vstr16(writer, self.table_id.as_bytes())?;
        writer.write_u32::<BigEndian>(self.generation)?;
        writer.write_u32::<BigEndian>(self.group_commit_interval_ms)?;

        // NOTE: Schemas are tiny
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.access_groups.len() as u16)?;
        for ag in &self.access_groups {
            coding::encode_vstr16(writer, ag.name.as_bytes())?;
            writer.write_u8(u8::from(ag.in_memory))?;
            writer.write_u32::<BigEndian>(ag.blocksize)?;
            writer.write_u16::<BigEndian>(ag.compressor.id())?;
            writer.write_u8(ag.bloom_mode.id())?;
        }

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.column_families.len() as u16)?;
        for cf in &self.column_families {
            writer.write_u8(cf.id)?;
            coding::encode_vstr16(writer, cf.name.as_bytes())?;
            coding::encode_vstr16(writer, cf.access_group.as_bytes())?;
            writer.write_u32::<BigEndian>(cf.max_versions)?;
            writer.write_u32::<BigEndian>(cf.ttl_secs)?;
            writer.write_u8(u8::from(cf.counter))?;
        }

        Ok(())
    }
}

impl Decode for Schema {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        fn string_field<R: Read>(reader: &mut R) -> Result<String, DecodeError> {
            String::from_utf8(coding::decode_vstr16(reader)?)
                .map_err(|_| DecodeError::InvalidHeader("Schema string"))
        }

        let table_id = string_field(reader)?;
        let generation = reader.read_u32::<BigEndian>()?;
        let group_commit_interval_ms = reader.read_u32::<BigEndian>()?;

        let ag_count = reader.read_u16::<BigEndian>()?;
        let mut access_groups = Vec::with_capacity(ag_count.into());
        for _ in 0..ag_count {
            let name = string_field(reader)?;
            let in_memory = reader.read_u8()? != 0;
            let blocksize = reader.read_u32::<BigEndian>()?;
            let compressor_id = reader.read_u16::<BigEndian>()?;
            let bloom_id = reader.read_u8()?;

            access_groups.push(AccessGroupSpec {
                name,
                in_memory,
                blocksize,
                compressor: CompressionType::from_id(compressor_id)
                    .map_err(|_| DecodeError::InvalidHeader("Schema compressor"))?,
                bloom_mode: crate::cell_store::BloomMode::from_id(bloom_id)
                    .map_err(|_| DecodeError::InvalidHeader("Schema bloom mode"))?,
            });
        }

        let cf_count = reader.read_u16::<BigEndian>()?;
        let mut column_families = Vec::with_capacity(cf_count.into());
        for _ in 0..cf_count {
            let id = reader.read_u8()?;
            let name = string_field(reader)?;
            let access_group = string_field(reader)?;
            let max_versions = reader.read_u32::<BigEndian>()?;
            let ttl_secs = reader.read_u32::<BigEndian>()?;
            let counter = reader.read_u8()? != 0;

            column_families.push(ColumnFamily {
                id,
                name,
                access_group,
                max_versions,
                ttl_secs,
                counter,
            });
        }

        Ok(Self {
            table_id: table_id.into(),
            generation,
            access_groups,
            column_families,
            group_commit_interval_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn schema_simple() -> crate::Result<()> {
        let schema = Schema::parse_simple("7", &[("default", &["x", "y"]), ("meta", &["z"])])?;

        assert_eq!(2, schema.access_groups.len());
        assert_eq!(3, schema.column_families.len());
        assert_eq!(1, schema.family_by_name("x").map(|cf| cf.id).unwrap_or(0));
        assert_eq!(3, schema.family_by_name("z").map(|cf| cf.id).unwrap_or(0));
        assert_eq!(
            "meta",
            schema.access_group_of(3).map(|ag| ag.name.as_str()).unwrap_or("")
        );
        assert_eq!(vec![1, 2], schema.families_of("default"));

        Ok(())
    }

    #[test]
    fn schema_rejects_duplicate_ids() {
        let mut schema = Schema::parse_simple("7", &[("default", &["x", "y"])])
            .expect("should build");
        schema.column_families[1].id = 1;

        assert!(matches!(
            schema.validate(),
            Err(crate::Error::BadSchema(_))
        ));
    }

    #[test]
    fn schema_rejects_unknown_access_group() {
        let mut schema = Schema::parse_simple("7", &[("default", &["x"])])
            .expect("should build");
        schema.column_families[0].access_group = "nope".into();

        assert!(matches!(
            schema.validate(),
            Err(crate::Error::BadSchema(_))
        ));
    }

    #[test]
    fn table_identifier_roundtrip() -> crate::Result<()> {
        use crate::coding::{Decode, Encode};

        let table = TableIdentifier::new("2/11", 5);
        let bytes = table.encode_into_vec();
        let decoded = TableIdentifier::decode_from(&mut &bytes[..])?;
        assert_eq!(table, decoded);

        Ok(())
    }

    #[test]
    fn schema_roundtrip() -> crate::Result<()> {
        use crate::coding::{Decode, Encode};

        let mut schema = Schema::parse_simple("9", &[("default", &["x"]), ("meta", &["y"])])?;
        schema.group_commit_interval_ms = 150;
        schema.column_families[1].max_versions = 3;
        schema.column_families[1].ttl_secs = 86_400;

        let bytes = schema.encode_into_vec();
        let decoded = Schema::decode_from(&mut &bytes[..])?;
        assert_eq!(schema, decoded);

        Ok(())
    }
}
