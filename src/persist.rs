//! Point in time record storage.
//!
//! [`TemporalStore`] is the contract the merge, diff and trait machinery
//! consumes. Every read names one layer and one [`TimeThreshold`]; `Latest`
//! answers from the latest projection while `AtTime(t)` answers from the
//! historic sequence, picking the newest record at or before `t` per identity.
//!
//! [`Persistor`] implements the contract on top of SQLite.

// used for persistence
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Error, OptionalExtension};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::construct::{
    AttributeSelection, AttributeState, CIAttribute, ChangesetId, Changeset, CiId, CiSelection,
    DataOrigin, Layer, LayerState, PartitionIndex, PredicateSelection, Relation, RelationIdentity,
    RelationSelection, TimeThreshold,
};
use crate::datatype::{decode, encode, AttributeValueType};
use crate::error::{Result, StrataError};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[async_trait]
pub trait TemporalStore: Send + Sync {
    // the caller scopes one logical write between begin and commit
    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    async fn create_ci(&self, ci: &CiId) -> Result<()>;
    async fn ci_ids(&self) -> Result<Vec<CiId>>;

    async fn upsert_layer(&self, layer: &Layer) -> Result<()>;
    async fn get_layer(&self, id: &str) -> Result<Option<Layer>>;

    async fn create_changeset(&self, changeset: &Changeset) -> Result<()>;
    async fn get_changeset(&self, id: &ChangesetId) -> Result<Option<Changeset>>;

    async fn start_new_partition(&self, at: DateTime<Utc>) -> Result<PartitionIndex>;
    async fn latest_partition_index(&self, time: &TimeThreshold) -> Result<PartitionIndex>;

    /// The current record for an attribute, removed ones included.
    async fn get_attribute(
        &self,
        name: &str,
        ci: &CiId,
        layer: &str,
        time: &TimeThreshold,
    ) -> Result<Option<CIAttribute>>;
    /// Like `get_attribute`, but binary values carry their payload.
    async fn get_full_binary_attribute(
        &self,
        name: &str,
        ci: &CiId,
        layer: &str,
        time: &TimeThreshold,
    ) -> Result<Option<CIAttribute>>;
    async fn get_attributes(
        &self,
        cis: &CiSelection,
        attributes: &AttributeSelection,
        layer: &str,
        time: &TimeThreshold,
        include_removed: bool,
    ) -> Result<Vec<CIAttribute>>;
    async fn find_attributes_by_name(
        &self,
        pattern: &str,
        cis: &CiSelection,
        layer: &str,
        time: &TimeThreshold,
        include_removed: bool,
    ) -> Result<Vec<CIAttribute>>;
    async fn append_historic_attributes(
        &self,
        records: &[CIAttribute],
        partition: PartitionIndex,
    ) -> Result<()>;
    async fn upsert_latest_attributes(&self, records: &[CIAttribute]) -> Result<()>;

    /// The current record for a relation, removed ones included.
    async fn get_relation(
        &self,
        identity: &RelationIdentity,
        layer: &str,
        time: &TimeThreshold,
    ) -> Result<Option<Relation>>;
    async fn get_relations(
        &self,
        selection: &RelationSelection,
        layer: &str,
        time: &TimeThreshold,
        include_removed: bool,
    ) -> Result<Vec<Relation>>;
    async fn append_historic_relations(
        &self,
        records: &[Relation],
        partition: PartitionIndex,
    ) -> Result<()>;
    async fn upsert_latest_relations(&self, records: &[Relation]) -> Result<()>;
}

pub enum PersistenceMode {
    InMemory,
    File(String),
}

const ATTRIBUTE_COLUMNS: &str = "Attribute_Identity, Name, CI_Identity, ValueType, ValueText, \
    ValueBinary, ValueControl, State, Changeset_Identity, Layer_Identity, AttributeTime";
const RELATION_COLUMNS: &str = "Relation_Identity, FromCI_Identity, ToCI_Identity, \
    Predicate_Identity, Changeset_Identity, Mask, Removed, Layer_Identity, RelationTime";

// ------------- Persistence -------------
pub struct Persistor {
    connection: Mutex<Connection>,
}
impl Persistor {
    pub fn new(mode: PersistenceMode) -> Result<Self> {
        let connection = match mode {
            PersistenceMode::InMemory => Connection::open_in_memory()?,
            PersistenceMode::File(path) => Connection::open(path)?,
        };
        add_regexp_function(&connection)?;
        connection.execute_batch(
            "
            create table if not exists CI (
                CI_Identity text not null,
                constraint referenceable_CI_Identity primary key (
                    CI_Identity
                )
            );
            create table if not exists Layer (
                Layer_Identity text not null,
                Description text not null,
                State text not null,
                Generators text not null,
                Color integer not null,
                constraint referenceable_Layer_Identity primary key (
                    Layer_Identity
                )
            );
            create table if not exists Changeset (
                Changeset_Identity text not null,
                UserName text not null,
                Layer_Identity text not null,
                Origin text not null,
                ChangesetTime text not null,
                constraint referenceable_Changeset_Identity primary key (
                    Changeset_Identity
                )
            );
            create table if not exists Partition (
                PartitionIndex text not null,
                constraint unique_PartitionIndex primary key (
                    PartitionIndex
                )
            );
            create table if not exists AttributeHistoric (
                Sequence integer primary key autoincrement,
                Attribute_Identity text not null,
                Name text not null,
                CI_Identity text not null,
                ValueType text not null,
                ValueText text not null,
                ValueBinary blob not null,
                ValueControl blob not null,
                State text not null,
                Changeset_Identity text not null,
                Layer_Identity text not null,
                AttributeTime text not null,
                PartitionIndex text not null,
                constraint unique_Attribute_Identity unique (
                    Attribute_Identity
                )
            );
            create index if not exists AttributeHistoric_by_identity on AttributeHistoric (
                Layer_Identity, CI_Identity, Name, AttributeTime
            );
            create table if not exists AttributeLatest (
                Attribute_Identity text not null,
                Name text not null,
                CI_Identity text not null,
                ValueType text not null,
                ValueText text not null,
                ValueBinary blob not null,
                ValueControl blob not null,
                State text not null,
                Changeset_Identity text not null,
                Layer_Identity text not null,
                AttributeTime text not null,
                constraint unique_AttributeLatest primary key (
                    Layer_Identity,
                    CI_Identity,
                    Name
                )
            );
            create table if not exists RelationHistoric (
                Sequence integer primary key autoincrement,
                Relation_Identity text not null,
                FromCI_Identity text not null,
                ToCI_Identity text not null,
                Predicate_Identity text not null,
                Changeset_Identity text not null,
                Mask integer not null,
                Removed integer not null,
                Layer_Identity text not null,
                RelationTime text not null,
                PartitionIndex text not null,
                constraint unique_Relation_Identity unique (
                    Relation_Identity
                )
            );
            create index if not exists RelationHistoric_by_identity on RelationHistoric (
                Layer_Identity, FromCI_Identity, ToCI_Identity, Predicate_Identity, RelationTime
            );
            create table if not exists RelationLatest (
                Relation_Identity text not null,
                FromCI_Identity text not null,
                ToCI_Identity text not null,
                Predicate_Identity text not null,
                Changeset_Identity text not null,
                Mask integer not null,
                Removed integer not null,
                Layer_Identity text not null,
                RelationTime text not null,
                constraint unique_RelationLatest primary key (
                    Layer_Identity,
                    FromCI_Identity,
                    ToCI_Identity,
                    Predicate_Identity
                )
            );
            ",
        )?;
        // every store starts out with a genesis partition
        connection.execute(
            "insert or ignore into Partition (PartitionIndex) values (?1)",
            params![DateTime::<Utc>::UNIX_EPOCH],
        )?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }
    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|e| StrataError::Lock(e.to_string()))
    }

    fn execute_plain(&self, sql: &str) -> Result<()> {
        self.connection()?.execute_batch(sql)?;
        Ok(())
    }

    pub fn persist_ci(&self, ci: &CiId) -> Result<()> {
        self.connection()?.execute(
            "insert or ignore into CI (CI_Identity) values (?1)",
            params![ci.to_string()],
        )?;
        Ok(())
    }
    pub fn restore_ci_ids(&self) -> Result<Vec<CiId>> {
        let connection = self.connection()?;
        let mut statement = connection.prepare_cached("select CI_Identity from CI")?;
        let raw = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        raw.iter().map(|s| parse_uuid(s)).collect()
    }

    pub fn persist_layer(&self, layer: &Layer) -> Result<()> {
        let generators = serde_json::to_string(&layer.generators)
            .map_err(|e| StrataError::Persistence(e.to_string()))?;
        self.connection()?.execute(
            "
            insert into Layer (
                Layer_Identity,
                Description,
                State,
                Generators,
                Color
            ) values (?1, ?2, ?3, ?4, ?5)
            on conflict (Layer_Identity) do update set
                Description = excluded.Description,
                State = excluded.State,
                Generators = excluded.Generators,
                Color = excluded.Color
            ",
            params![
                layer.id,
                layer.description,
                layer.state.as_str(),
                generators,
                layer.color
            ],
        )?;
        Ok(())
    }
    pub fn restore_layer(&self, id: &str) -> Result<Option<Layer>> {
        let connection = self.connection()?;
        let mut statement = connection.prepare_cached(
            "
            select Layer_Identity, Description, State, Generators, Color
                from Layer
                where Layer_Identity = ?1
            ",
        )?;
        let raw = statement
            .query_row(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                ))
            })
            .optional()?;
        match raw {
            None => Ok(None),
            Some((id, description, state, generators, color)) => {
                let state = LayerState::parse(&state)
                    .ok_or_else(|| StrataError::decode(format!("unknown layer state '{state}'")))?;
                let generators: Vec<String> = serde_json::from_str(&generators)?;
                Ok(Some(Layer {
                    id,
                    description,
                    state,
                    generators,
                    color,
                }))
            }
        }
    }

    pub fn persist_changeset(&self, changeset: &Changeset) -> Result<()> {
        self.connection()?.execute(
            "
            insert into Changeset (
                Changeset_Identity,
                UserName,
                Layer_Identity,
                Origin,
                ChangesetTime
            ) values (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                changeset.id.to_string(),
                changeset.user,
                changeset.layer,
                changeset.origin.as_str(),
                changeset.timestamp
            ],
        )?;
        Ok(())
    }
    pub fn restore_changeset(&self, id: &ChangesetId) -> Result<Option<Changeset>> {
        let connection = self.connection()?;
        let mut statement = connection.prepare_cached(
            "
            select UserName, Layer_Identity, Origin, ChangesetTime
                from Changeset
                where Changeset_Identity = ?1
            ",
        )?;
        let raw = statement
            .query_row(params![id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, DateTime<Utc>>(3)?,
                ))
            })
            .optional()?;
        match raw {
            None => Ok(None),
            Some((user, layer, origin, timestamp)) => {
                let origin = DataOrigin::parse(&origin)
                    .ok_or_else(|| StrataError::decode(format!("unknown data origin '{origin}'")))?;
                Ok(Some(Changeset {
                    id: *id,
                    user,
                    layer,
                    origin,
                    timestamp,
                }))
            }
        }
    }

    pub fn persist_partition(&self, at: DateTime<Utc>) -> Result<PartitionIndex> {
        self.connection()?.execute(
            "insert or ignore into Partition (PartitionIndex) values (?1)",
            params![at],
        )?;
        Ok(PartitionIndex(at))
    }
    pub fn restore_latest_partition(&self, time: &TimeThreshold) -> Result<PartitionIndex> {
        let connection = self.connection()?;
        let latest: Option<DateTime<Utc>> = connection.query_row(
            "select max(PartitionIndex) from Partition where PartitionIndex <= ?1",
            params![time.resolve()],
            |row| row.get(0),
        )?;
        latest
            .map(PartitionIndex)
            .ok_or_else(|| StrataError::Persistence(format!("no partition exists at {:?}", time)))
    }

    pub fn restore_attributes(
        &self,
        mut filter: Filter,
        layer: &str,
        time: &TimeThreshold,
        include_removed: bool,
        full_binary: bool,
    ) -> Result<Vec<CIAttribute>> {
        let removed = if include_removed {
            String::new()
        } else {
            format!("and State <> '{}'", AttributeState::Removed.as_str())
        };
        let mut values = vec![Value::Text(layer.to_owned())];
        let sql = match time {
            TimeThreshold::Latest => format!(
                "
                select {ATTRIBUTE_COLUMNS}
                    from AttributeLatest
                    where Layer_Identity = ? and {} {removed}
                ",
                filter.sql()
            ),
            TimeThreshold::AtTime(t) => {
                values.push(Value::Text(sql_time(t)?));
                format!(
                    "
                    select {ATTRIBUTE_COLUMNS} from (
                        select {ATTRIBUTE_COLUMNS}, row_number() over (
                            partition by CI_Identity, Name
                            order by AttributeTime desc, Sequence desc
                        ) as Recency
                            from AttributeHistoric
                            where Layer_Identity = ? and AttributeTime <= ? and {}
                    ) where Recency = 1 {removed}
                    ",
                    filter.sql()
                )
            }
        };
        values.append(&mut filter.values);
        let connection = self.connection()?;
        let mut statement = connection.prepare(&sql)?;
        let raw = statement
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(RawAttribute {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    ci: row.get(2)?,
                    value_type: row.get(3)?,
                    text: row.get(4)?,
                    binary: row.get(5)?,
                    control: row.get(6)?,
                    state: row.get(7)?,
                    changeset: row.get(8)?,
                    layer: row.get(9)?,
                    timestamp: row.get(10)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<RawAttribute>>>()?;
        raw.into_iter()
            .map(|r| r.into_attribute(full_binary))
            .collect()
    }

    pub fn persist_historic_attributes(
        &self,
        records: &[CIAttribute],
        partition: PartitionIndex,
    ) -> Result<()> {
        let connection = self.connection()?;
        let mut statement = connection.prepare_cached(&format!(
            "
            insert into AttributeHistoric (
                {ATTRIBUTE_COLUMNS},
                PartitionIndex
            ) values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "
        ))?;
        for record in records {
            let encoded = encode(&record.value)?;
            statement.execute(params![
                record.id.to_string(),
                record.name,
                record.ci.to_string(),
                record.value.value_type().as_str(),
                encoded.text,
                encoded.binary,
                encoded.control,
                record.state.as_str(),
                record.changeset.to_string(),
                record.layer,
                record.timestamp,
                partition.0
            ])?;
        }
        Ok(())
    }
    pub fn persist_latest_attributes(&self, records: &[CIAttribute]) -> Result<()> {
        let connection = self.connection()?;
        let mut statement = connection.prepare_cached(&format!(
            "
            insert into AttributeLatest (
                {ATTRIBUTE_COLUMNS}
            ) values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            on conflict (Layer_Identity, CI_Identity, Name) do update set
                Attribute_Identity = excluded.Attribute_Identity,
                ValueType = excluded.ValueType,
                ValueText = excluded.ValueText,
                ValueBinary = excluded.ValueBinary,
                ValueControl = excluded.ValueControl,
                State = excluded.State,
                Changeset_Identity = excluded.Changeset_Identity,
                AttributeTime = excluded.AttributeTime
            "
        ))?;
        for record in records {
            let encoded = encode(&record.value)?;
            statement.execute(params![
                record.id.to_string(),
                record.name,
                record.ci.to_string(),
                record.value.value_type().as_str(),
                encoded.text,
                encoded.binary,
                encoded.control,
                record.state.as_str(),
                record.changeset.to_string(),
                record.layer,
                record.timestamp
            ])?;
        }
        Ok(())
    }

    pub fn restore_relations(
        &self,
        mut filter: Filter,
        layer: &str,
        time: &TimeThreshold,
        include_removed: bool,
    ) -> Result<Vec<Relation>> {
        let removed = if include_removed { "" } else { "and Removed = 0" };
        let mut values = vec![Value::Text(layer.to_owned())];
        let sql = match time {
            TimeThreshold::Latest => format!(
                "
                select {RELATION_COLUMNS}
                    from RelationLatest
                    where Layer_Identity = ? and {} {removed}
                ",
                filter.sql()
            ),
            TimeThreshold::AtTime(t) => {
                values.push(Value::Text(sql_time(t)?));
                format!(
                    "
                    select {RELATION_COLUMNS} from (
                        select {RELATION_COLUMNS}, row_number() over (
                            partition by FromCI_Identity, ToCI_Identity, Predicate_Identity
                            order by RelationTime desc, Sequence desc
                        ) as Recency
                            from RelationHistoric
                            where Layer_Identity = ? and RelationTime <= ? and {}
                    ) where Recency = 1 {removed}
                    ",
                    filter.sql()
                )
            }
        };
        values.append(&mut filter.values);
        let connection = self.connection()?;
        let mut statement = connection.prepare(&sql)?;
        let raw = statement
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(RawRelation {
                    id: row.get(0)?,
                    from: row.get(1)?,
                    to: row.get(2)?,
                    predicate: row.get(3)?,
                    changeset: row.get(4)?,
                    mask: row.get(5)?,
                    removed: row.get(6)?,
                    layer: row.get(7)?,
                    timestamp: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<RawRelation>>>()?;
        raw.into_iter().map(RawRelation::into_relation).collect()
    }

    pub fn persist_historic_relations(
        &self,
        records: &[Relation],
        partition: PartitionIndex,
    ) -> Result<()> {
        let connection = self.connection()?;
        let mut statement = connection.prepare_cached(&format!(
            "
            insert into RelationHistoric (
                {RELATION_COLUMNS},
                PartitionIndex
            ) values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "
        ))?;
        for record in records {
            statement.execute(params![
                record.id.to_string(),
                record.from.to_string(),
                record.to.to_string(),
                record.predicate,
                record.changeset.to_string(),
                record.mask,
                record.removed,
                record.layer,
                record.timestamp,
                partition.0
            ])?;
        }
        Ok(())
    }
    pub fn persist_latest_relations(&self, records: &[Relation]) -> Result<()> {
        let connection = self.connection()?;
        let mut statement = connection.prepare_cached(&format!(
            "
            insert into RelationLatest (
                {RELATION_COLUMNS}
            ) values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            on conflict (Layer_Identity, FromCI_Identity, ToCI_Identity, Predicate_Identity) do update set
                Relation_Identity = excluded.Relation_Identity,
                Changeset_Identity = excluded.Changeset_Identity,
                Mask = excluded.Mask,
                Removed = excluded.Removed,
                RelationTime = excluded.RelationTime
            "
        ))?;
        for record in records {
            statement.execute(params![
                record.id.to_string(),
                record.from.to_string(),
                record.to.to_string(),
                record.predicate,
                record.changeset.to_string(),
                record.mask,
                record.removed,
                record.layer,
                record.timestamp
            ])?;
        }
        Ok(())
    }
}

#[async_trait]
impl TemporalStore for Persistor {
    async fn begin(&self) -> Result<()> {
        self.execute_plain("begin")
    }
    async fn commit(&self) -> Result<()> {
        self.execute_plain("commit")
    }
    async fn rollback(&self) -> Result<()> {
        debug!("rolling back transaction");
        self.execute_plain("rollback")
    }

    async fn create_ci(&self, ci: &CiId) -> Result<()> {
        self.persist_ci(ci)
    }
    async fn ci_ids(&self) -> Result<Vec<CiId>> {
        self.restore_ci_ids()
    }

    async fn upsert_layer(&self, layer: &Layer) -> Result<()> {
        self.persist_layer(layer)
    }
    async fn get_layer(&self, id: &str) -> Result<Option<Layer>> {
        self.restore_layer(id)
    }

    async fn create_changeset(&self, changeset: &Changeset) -> Result<()> {
        self.persist_changeset(changeset)
    }
    async fn get_changeset(&self, id: &ChangesetId) -> Result<Option<Changeset>> {
        self.restore_changeset(id)
    }

    async fn start_new_partition(&self, at: DateTime<Utc>) -> Result<PartitionIndex> {
        self.persist_partition(at)
    }
    async fn latest_partition_index(&self, time: &TimeThreshold) -> Result<PartitionIndex> {
        self.restore_latest_partition(time)
    }

    async fn get_attribute(
        &self,
        name: &str,
        ci: &CiId,
        layer: &str,
        time: &TimeThreshold,
    ) -> Result<Option<CIAttribute>> {
        let filter = Filter::single_attribute(name, ci);
        Ok(self
            .restore_attributes(filter, layer, time, true, false)?
            .into_iter()
            .next())
    }
    async fn get_full_binary_attribute(
        &self,
        name: &str,
        ci: &CiId,
        layer: &str,
        time: &TimeThreshold,
    ) -> Result<Option<CIAttribute>> {
        let filter = Filter::single_attribute(name, ci);
        Ok(self
            .restore_attributes(filter, layer, time, true, true)?
            .into_iter()
            .next())
    }
    async fn get_attributes(
        &self,
        cis: &CiSelection,
        attributes: &AttributeSelection,
        layer: &str,
        time: &TimeThreshold,
        include_removed: bool,
    ) -> Result<Vec<CIAttribute>> {
        let mut filter = Filter::new();
        if !filter.ci_selection("CI_Identity", cis) {
            return Ok(Vec::new());
        }
        match attributes {
            AttributeSelection::All => {}
            AttributeSelection::Named(names) => {
                filter.within("Name", names.iter().map(|n| Value::Text(n.clone())), false)
            }
            AttributeSelection::None => return Ok(Vec::new()),
        }
        self.restore_attributes(filter, layer, time, include_removed, false)
    }
    async fn find_attributes_by_name(
        &self,
        pattern: &str,
        cis: &CiSelection,
        layer: &str,
        time: &TimeThreshold,
        include_removed: bool,
    ) -> Result<Vec<CIAttribute>> {
        // reject broken patterns before they reach the database
        Regex::new(pattern).map_err(|e| StrataError::InvalidInput(e.to_string()))?;
        let mut filter = Filter::new();
        if !filter.ci_selection("CI_Identity", cis) {
            return Ok(Vec::new());
        }
        filter.clause("Name regexp ?", vec![Value::Text(pattern.to_owned())]);
        self.restore_attributes(filter, layer, time, include_removed, false)
    }
    async fn append_historic_attributes(
        &self,
        records: &[CIAttribute],
        partition: PartitionIndex,
    ) -> Result<()> {
        self.persist_historic_attributes(records, partition)
    }
    async fn upsert_latest_attributes(&self, records: &[CIAttribute]) -> Result<()> {
        self.persist_latest_attributes(records)
    }

    async fn get_relation(
        &self,
        identity: &RelationIdentity,
        layer: &str,
        time: &TimeThreshold,
    ) -> Result<Option<Relation>> {
        let mut filter = Filter::new();
        filter.clause(
            "FromCI_Identity = ? and ToCI_Identity = ? and Predicate_Identity = ?",
            vec![
                Value::Text(identity.from.to_string()),
                Value::Text(identity.to.to_string()),
                Value::Text(identity.predicate.clone()),
            ],
        );
        Ok(self
            .restore_relations(filter, layer, time, true)?
            .into_iter()
            .next())
    }
    async fn get_relations(
        &self,
        selection: &RelationSelection,
        layer: &str,
        time: &TimeThreshold,
        include_removed: bool,
    ) -> Result<Vec<Relation>> {
        let mut filter = Filter::new();
        if !filter.relation_selection(selection) {
            return Ok(Vec::new());
        }
        self.restore_relations(filter, layer, time, include_removed)
    }
    async fn append_historic_relations(
        &self,
        records: &[Relation],
        partition: PartitionIndex,
    ) -> Result<()> {
        self.persist_historic_relations(records, partition)
    }
    async fn upsert_latest_relations(&self, records: &[Relation]) -> Result<()> {
        self.persist_latest_relations(records)
    }
}

// ------------- Query building -------------
/// Where-clause fragments with their positional values.
#[derive(Debug, Default)]
pub struct Filter {
    clauses: Vec<String>,
    values: Vec<Value>,
}
impl Filter {
    pub fn new() -> Self {
        Self::default()
    }
    fn single_attribute(name: &str, ci: &CiId) -> Self {
        let mut filter = Self::new();
        filter.clause(
            "CI_Identity = ? and Name = ?",
            vec![Value::Text(ci.to_string()), Value::Text(name.to_owned())],
        );
        filter
    }
    fn clause(&mut self, clause: impl Into<String>, mut values: Vec<Value>) {
        self.clauses.push(clause.into());
        self.values.append(&mut values);
    }
    fn within<I: Iterator<Item = Value>>(&mut self, column: &str, values: I, negate: bool) {
        let values: Vec<Value> = values.collect();
        let placeholders = vec!["?"; values.len()].join(", ");
        let operator = if negate { "not in" } else { "in" };
        self.clause(format!("{column} {operator} ({placeholders})"), values);
    }
    /// Narrows to a CI selection, false when nothing can match.
    fn ci_selection(&mut self, column: &str, cis: &CiSelection) -> bool {
        match cis {
            CiSelection::All => true,
            CiSelection::Specific(set) => {
                self.within(column, set.iter().map(|c| Value::Text(c.to_string())), false);
                true
            }
            CiSelection::AllExcept(set) => {
                self.within(column, set.iter().map(|c| Value::Text(c.to_string())), true);
                true
            }
            CiSelection::None => false,
        }
    }
    fn relation_selection(&mut self, selection: &RelationSelection) -> bool {
        match selection {
            RelationSelection::All => true,
            RelationSelection::From(cis) => self.ci_selection("FromCI_Identity", cis),
            RelationSelection::To(cis) => self.ci_selection("ToCI_Identity", cis),
            RelationSelection::Either(cis) => {
                let (set, operator) = match cis {
                    CiSelection::All => return true,
                    CiSelection::None => return false,
                    CiSelection::Specific(set) => (set, "in"),
                    CiSelection::AllExcept(set) => (set, "not in"),
                };
                let ids: Vec<Value> = set.iter().map(|c| Value::Text(c.to_string())).collect();
                let placeholders = vec!["?"; ids.len()].join(", ");
                let mut values = ids.clone();
                values.extend(ids);
                self.clause(
                    format!(
                        "(FromCI_Identity {operator} ({placeholders}) or ToCI_Identity {operator} ({placeholders}))"
                    ),
                    values,
                );
                true
            }
            RelationSelection::WithPredicate(predicates) => match predicates {
                PredicateSelection::All => true,
                PredicateSelection::None => false,
                PredicateSelection::Specific(set) => {
                    self.within(
                        "Predicate_Identity",
                        set.iter().map(|p| Value::Text(p.clone())),
                        false,
                    );
                    true
                }
            },
            RelationSelection::Specific(identities) => {
                if identities.is_empty() {
                    return false;
                }
                let mut values = Vec::with_capacity(identities.len() * 3);
                let mut parts = Vec::with_capacity(identities.len());
                for identity in identities {
                    parts.push("(FromCI_Identity = ? and ToCI_Identity = ? and Predicate_Identity = ?)");
                    values.push(Value::Text(identity.from.to_string()));
                    values.push(Value::Text(identity.to.to_string()));
                    values.push(Value::Text(identity.predicate.clone()));
                }
                self.clause(format!("({})", parts.join(" or ")), values);
                true
            }
        }
    }
    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            self.clauses.join(" and ")
        }
    }
}

// ------------- Row conversion -------------
struct RawAttribute {
    id: String,
    name: String,
    ci: String,
    value_type: String,
    text: String,
    binary: Vec<u8>,
    control: Vec<u8>,
    state: String,
    changeset: String,
    layer: String,
    timestamp: DateTime<Utc>,
}
impl RawAttribute {
    fn into_attribute(self, full_binary: bool) -> Result<CIAttribute> {
        let context = format!(
            "attribute {} of CI {} in layer {}",
            self.name, self.ci, self.layer
        );
        let convert = || -> Result<CIAttribute> {
            let value_type = AttributeValueType::parse(&self.value_type).ok_or_else(|| {
                StrataError::decode(format!("unknown value type '{}'", self.value_type))
            })?;
            let state = AttributeState::parse(&self.state)
                .ok_or_else(|| StrataError::decode(format!("unknown state '{}'", self.state)))?;
            let value = decode(&self.text, &self.binary, &self.control, value_type, full_binary)?;
            Ok(CIAttribute {
                id: parse_uuid(&self.id)?,
                name: self.name.clone(),
                ci: parse_uuid(&self.ci)?,
                value,
                state,
                changeset: parse_uuid(&self.changeset)?,
                layer: self.layer.clone(),
                timestamp: self.timestamp,
            })
        };
        convert().map_err(|e| e.with_context(context))
    }
}

struct RawRelation {
    id: String,
    from: String,
    to: String,
    predicate: String,
    changeset: String,
    mask: bool,
    removed: bool,
    layer: String,
    timestamp: DateTime<Utc>,
}
impl RawRelation {
    fn into_relation(self) -> Result<Relation> {
        let context = format!(
            "relation {}_{}_{} in layer {}",
            self.from, self.to, self.predicate, self.layer
        );
        let convert = || -> Result<Relation> {
            Ok(Relation {
                id: parse_uuid(&self.id)?,
                from: parse_uuid(&self.from)?,
                to: parse_uuid(&self.to)?,
                predicate: self.predicate.clone(),
                changeset: parse_uuid(&self.changeset)?,
                mask: self.mask,
                removed: self.removed,
                layer: self.layer.clone(),
                timestamp: self.timestamp,
            })
        };
        convert().map_err(|e| e.with_context(context))
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StrataError::decode(format!("'{s}' is not a valid id: {e}")))
}

// times are compared as text, so they must be rendered the way rusqlite stores them
fn sql_time(t: &DateTime<Utc>) -> Result<String> {
    use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
    match t.to_sql()? {
        ToSqlOutput::Owned(Value::Text(s)) => Ok(s),
        ToSqlOutput::Borrowed(ValueRef::Text(bytes)) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        _ => Err(StrataError::Persistence("unexpected time representation".into())),
    }
}

// regexp() backs the `name regexp ?` operator used for name patterns
fn add_regexp_function(connection: &Connection) -> Result<()> {
    connection.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let regexp: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> std::result::Result<_, BoxError> {
                Ok(Regex::new(vr.as_str()?)?)
            })?;
            let is_match = {
                let text = ctx
                    .get_raw(1)
                    .as_str()
                    .map_err(|e| Error::UserFunctionError(e.into()))?;
                regexp.is_match(text)
            };
            Ok(is_match)
        },
    )?;
    Ok(())
}
