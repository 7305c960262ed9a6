//! Row-level entry points called by the SQL engine.
//!
//! Each entry point checks access and admission, then hands one
//! [`RowOp`] to [`Session::dispatch`]: streaming modes send it through the
//! restart wrapper, and every mode appends it to the shadow buffer once the
//! send has gone through.

use bytes::Bytes;
use osql_types::{Genid, MasterErrorCode, TableName};

use super::Session;
use super::send::Retry;
use crate::error::{OsqlError, OsqlResult};
use crate::message::{
    BlobPayload, BpfuncCall, KeyMask, OsqlMessage, ReadEntry, ReadKind, SchemaChange, TableTarget,
};
use crate::shadow::{BlobSend, IndexKey, RowOp, ShadowBuffer};

// ============================================================================
// Inputs
// ============================================================================

/// What the session needs to know about a table's shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub target: TableTarget,
    pub index_count: usize,
    pub has_expression_indexes: bool,
    pub has_partial_indexes: bool,
    /// Column position of each declared blob, in blob order.
    pub blob_columns: Vec<usize>,
}

impl TableDescriptor {
    /// A table with no indexes and no blobs.
    pub fn plain(name: impl Into<TableName>, version: u64) -> Self {
        Self {
            target: TableTarget::new(name, version),
            index_count: 0,
            has_expression_indexes: false,
            has_partial_indexes: false,
            blob_columns: Vec::new(),
        }
    }

    pub fn name(&self) -> &TableName {
        &self.target.name
    }
}

/// Index keys of a row plus the changed-key mask.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexKeys {
    /// One key per index, in index-definition order.
    pub keys: Vec<Bytes>,
    pub changed: KeyMask,
}

impl IndexKeys {
    pub fn new(keys: Vec<Bytes>, changed: KeyMask) -> Self {
        Self { keys, changed }
    }
}

/// New image of a row for insert or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub genid: Genid,
    pub row: Bytes,
    pub flags: u32,
    /// Per declared blob; `None` when the column holds no value.
    pub blobs: Vec<Option<Bytes>>,
    pub ins_keys: IndexKeys,
    pub del_keys: IndexKeys,
    /// Per column, the new position or -1 when unchanged (updates only).
    pub updated_columns: Option<Vec<i32>>,
}

impl RowChange {
    pub fn new(genid: Genid, row: Bytes) -> Self {
        Self {
            genid,
            row,
            flags: 0,
            blobs: Vec::new(),
            ins_keys: IndexKeys::default(),
            del_keys: IndexKeys::default(),
            updated_columns: None,
        }
    }

    pub fn with_blobs(mut self, blobs: Vec<Option<Bytes>>) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn with_index_keys(mut self, ins_keys: IndexKeys, del_keys: IndexKeys) -> Self {
        self.ins_keys = ins_keys;
        self.del_keys = del_keys;
        self
    }

    pub fn with_updated_columns(mut self, columns: Vec<i32>) -> Self {
        self.updated_columns = Some(columns);
        self
    }
}

// ============================================================================
// Entry points
// ============================================================================

impl<S: ShadowBuffer> Session<S> {
    /// Inserts a row: index keys, blobs, then the record.
    pub fn insert(&mut self, table: &TableDescriptor, change: &RowChange) -> OsqlResult<()> {
        self.check_active()?;
        self.check_write_access(table.name())?;
        self.index_insert(table, change.genid, &change.ins_keys)?;
        self.send_blobs(table, change.genid, &change.blobs, None)?;

        self.link.admit()?;
        self.link.check_dml(table.name())?;
        let op = RowOp::Insert {
            target: table.target.clone(),
            genid: change.genid,
            ins_keys: self.key_mask(table, change.ins_keys.changed),
            row: change.row.clone(),
            flags: change.flags,
        };
        self.dispatch(op)?;
        self.link.state.effects.inserted += 1;
        Ok(())
    }

    /// Updates a row: old keys out, new keys in, blobs, changed columns,
    /// then the record.
    pub fn update(&mut self, table: &TableDescriptor, change: &RowChange) -> OsqlResult<()> {
        self.check_active()?;
        self.check_write_access(table.name())?;
        self.index_delete(table, change.genid, &change.del_keys)?;
        self.index_insert(table, change.genid, &change.ins_keys)?;
        self.send_blobs(
            table,
            change.genid,
            &change.blobs,
            change.updated_columns.as_deref(),
        )?;
        if let Some(columns) = &change.updated_columns {
            self.update_columns(table, change.genid, columns)?;
        }

        self.link.admit()?;
        self.link.check_dml(table.name())?;
        let op = RowOp::Update {
            target: table.target.clone(),
            genid: change.genid,
            ins_keys: self.key_mask(table, change.ins_keys.changed),
            del_keys: self.key_mask(table, change.del_keys.changed),
            row: change.row.clone(),
            flags: change.flags,
        };
        self.dispatch(op)?;
        self.link.state.effects.updated += 1;
        Ok(())
    }

    /// Deletes a row: old keys out, then the record.
    pub fn delete(
        &mut self,
        table: &TableDescriptor,
        genid: Genid,
        del_keys: &IndexKeys,
    ) -> OsqlResult<()> {
        self.check_active()?;
        self.check_write_access(table.name())?;
        self.index_delete(table, genid, del_keys)?;

        self.link.admit()?;
        self.link.check_dml(table.name())?;
        let op = RowOp::Delete {
            target: table.target.clone(),
            genid,
            del_keys: self.key_mask(table, del_keys.changed),
        };
        self.dispatch(op)?;
        self.link.state.effects.deleted += 1;
        Ok(())
    }

    /// Ships new index keys; only tables with expression indexes need them.
    pub fn index_insert(
        &mut self,
        table: &TableDescriptor,
        genid: Genid,
        keys: &IndexKeys,
    ) -> OsqlResult<()> {
        self.send_index(table, genid, keys, false)
    }

    /// Ships old index keys; only tables with expression indexes need them.
    pub fn index_delete(
        &mut self,
        table: &TableDescriptor,
        genid: Genid,
        keys: &IndexKeys,
    ) -> OsqlResult<()> {
        self.send_index(table, genid, keys, true)
    }

    fn send_index(
        &mut self,
        table: &TableDescriptor,
        genid: Genid,
        keys: &IndexKeys,
        is_delete: bool,
    ) -> OsqlResult<()> {
        self.check_active()?;
        let features = &self.link.env.config.features;
        if !(features.expression_indexes && table.has_expression_indexes) {
            return Ok(());
        }
        let filter = features.partial_indexes && table.has_partial_indexes;
        let keys: Vec<IndexKey> = (0u32..)
            .zip(keys.keys.iter().take(table.index_count))
            .filter(|(index, _)| !filter || keys.changed.contains(*index))
            .map(|(index, key)| IndexKey {
                index,
                key: key.clone(),
            })
            .collect();

        self.link.admit()?;
        self.link.check_dml(table.name())?;
        if keys.is_empty() {
            return Ok(());
        }
        self.dispatch(RowOp::Index {
            target: table.target.clone(),
            genid,
            is_delete,
            keys,
        })
    }

    /// Ships every present blob of a row.
    ///
    /// For updates, a non-empty blob whose column the update did not touch
    /// is sent as "not used" when blob optimization is on.
    pub fn send_blobs(
        &mut self,
        table: &TableDescriptor,
        genid: Genid,
        blobs: &[Option<Bytes>],
        updated_columns: Option<&[i32]>,
    ) -> OsqlResult<()> {
        self.check_active()?;
        let optimize = self.link.env.config.features.blob_optimization;
        let sends: Vec<BlobSend> = (0u32..)
            .zip(blobs)
            .filter_map(|(index, blob)| {
                let data = blob.as_ref()?;
                let untouched = optimize
                    && !data.is_empty()
                    && usize::try_from(index)
                        .ok()
                        .and_then(|i| table.blob_columns.get(i))
                        .zip(updated_columns)
                        .and_then(|(column, columns)| columns.get(*column))
                        .is_some_and(|&position| position == -1);
                let payload = if untouched {
                    BlobPayload::NotUsed
                } else {
                    BlobPayload::Data(data.clone())
                };
                Some(BlobSend { index, payload })
            })
            .collect();
        if sends.is_empty() {
            return Ok(());
        }

        self.link.check_dml(table.name())?;
        self.dispatch(RowOp::Blobs {
            target: table.target.clone(),
            genid,
            blobs: sends,
        })
    }

    /// Ships the changed-column map of an update.
    pub fn update_columns(
        &mut self,
        table: &TableDescriptor,
        genid: Genid,
        columns: &[i32],
    ) -> OsqlResult<()> {
        self.check_active()?;
        self.link.check_dml(table.name())?;
        self.dispatch(RowOp::UpdateCols {
            target: table.target.clone(),
            genid,
            columns: columns.to_vec(),
        })
    }

    /// Asks the master to verify a row read by the transaction.
    pub fn record_genid(&mut self, table: &TableDescriptor, genid: Genid) -> OsqlResult<()> {
        self.check_active()?;
        if genid.is_synthetic() {
            tracing::debug!(%genid, "skipping synthetic genid");
            return Ok(());
        }
        self.link.check_dml(table.name())?;
        self.dispatch(RowOp::RecordGenid {
            target: table.target.clone(),
            genid,
        })
    }

    /// Consumes an event from a stored procedure's queue.
    ///
    /// Buffered before sending; a restart's replay delivers it.
    pub fn dbqueue_consume(&mut self, procedure: &str, genid: Genid) -> OsqlResult<()> {
        self.check_active()?;
        let queue = TableTarget::new(TableName::for_queue(procedure), 0);
        self.link.check_dml(&queue.name)?;
        let op = RowOp::DbqConsume { queue, genid };
        self.shadow.append(op.clone())?;
        if self.link.options.mode.streams_to_master() {
            self.link.ensure_started()?;
            self.send_with_restart(Retry::BUFFERED, |link| link.send_op(&op))?;
        }
        Ok(())
    }

    /// Ships a row of the statistics table.
    pub fn update_stat1(&mut self, genid: Genid, row: Bytes, stat_index: i32) -> OsqlResult<()> {
        self.check_active()?;
        self.dispatch(RowOp::UpdateStat {
            genid,
            row,
            stat_index,
        })
    }

    /// Ships a schema change.
    ///
    /// `target` is the table announced before the change, `None` for a view
    /// with no shard.
    pub fn schema_change(
        &mut self,
        mut change: SchemaChange,
        target: Option<TableTarget>,
    ) -> OsqlResult<()> {
        self.check_active()?;
        self.link.state.running_ddl = true;
        self.link.check_ddl(&change.table)?;

        let resumable = self.link.env.config.commit.schema_change_resume_autocommit
            && !self.link.options.in_client_transaction;
        if !resumable && self.link.options.mode.streams_to_master() {
            self.link.ensure_started()?;
            change.bound_session = self.key();
        }
        tracing::info!(
            table = %change.table,
            bound = change.bound_session.is_some(),
            "schema change"
        );
        self.dispatch(RowOp::SchemaChange { change, target })
    }

    /// Ships a stored function call.
    pub fn bpfunc(&mut self, call: BpfuncCall) -> OsqlResult<()> {
        self.check_active()?;
        self.dispatch(RowOp::Bpfunc(call))
    }

    /// Asks the master to attach its debug log for `query_id` to this session.
    pub fn query_debug_log(&mut self, query_id: i32) -> OsqlResult<()> {
        self.check_active()?;
        self.link.ensure_started()?;
        let cookie = *self
            .link
            .state
            .debug_cookie
            .get_or_insert_with(rand::random::<u64>);
        self.send_with_restart(Retry::OPERATION, |link| {
            link.send_raw(&OsqlMessage::DebugLog { cookie, query_id })
        })
    }

    /// Records a row read, for read-set shipment at commit.
    pub fn record_read(&mut self, kind: ReadKind, table: TableName, genid: Genid) -> OsqlResult<()> {
        self.check_active()?;
        self.shadow
            .record_read(kind, ReadEntry { table, genid })
            .map_err(OsqlError::from)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Sends (streaming modes) then buffers one operation.
    fn dispatch(&mut self, op: RowOp) -> OsqlResult<()> {
        if self.link.options.mode.streams_to_master() {
            self.link.ensure_started()?;
            self.send_with_restart(Retry::OPERATION, |link| link.send_op(&op))?;
        }
        tracing::debug!(kind = ?op.messages().first().map(OsqlMessage::kind), "buffered operation");
        self.shadow.append(op).map_err(OsqlError::from)
    }

    fn check_write_access(&mut self, table: &TableName) -> OsqlResult<()> {
        let user = self.link.options.user.as_deref();
        if let Err(reason) = self.link.env.access.check_write(table, user) {
            tracing::warn!(%table, user, %reason, "write access denied");
            self.link.state.error.set(
                MasterErrorCode::ACCESS,
                format!("Write access denied to {table}: {reason}"),
            );
            return Err(OsqlError::AccessDenied(reason));
        }
        Ok(())
    }

    /// Changed-key mask to ship, all-ones unless partial indexes apply.
    fn key_mask(&self, table: &TableDescriptor, changed: KeyMask) -> KeyMask {
        if self.link.env.config.features.partial_indexes && table.has_partial_indexes {
            changed
        } else {
            KeyMask::ALL
        }
    }
}
