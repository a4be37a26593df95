//! Output catalog: which stage run produced which sets of entities.
//!
//! # Responsibility
//! - Record stage runs with their parameters and final status.
//! - Persist the output sets of a run and their items.
//!
//! # Invariants
//! - A set and all its items are written in one transaction.
//! - Set names are unique within a run.
//! - Transforms are stored as row-major JSON arrays of 16 numbers.

use crate::db::DbError;
use crate::error::ErrorKind;
use crate::model::{Coordinate3D, SubTomogram, TomoMask, Tomogram};
use crate::transform::to_row_major;
use log::info;
use rusqlite::{params, Connection, OptionalExtension};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub type RunId = Uuid;
pub type SetId = Uuid;
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Entity type held by an output set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    Tomograms,
    SubTomograms,
    Coordinates,
    TomoMasks,
}

impl SetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tomograms => "tomograms",
            Self::SubTomograms => "subtomograms",
            Self::Coordinates => "coordinates",
            Self::TomoMasks => "tomo_masks",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tomograms" => Some(Self::Tomograms),
            "subtomograms" => Some(Self::SubTomograms),
            "coordinates" => Some(Self::Coordinates),
            "tomo_masks" => Some(Self::TomoMasks),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One persisted entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogItem {
    pub file_name: String,
    pub vol_name: Option<String>,
    pub class_id: Option<i64>,
    /// 1-based volume index inside a multi-volume tomogram file.
    pub stack_index: Option<u32>,
    pub group_id: Option<String>,
    pub position: Option<[f64; 3]>,
    pub transform: Option<[f64; 16]>,
}

impl CatalogItem {
    fn file(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            vol_name: None,
            class_id: None,
            stack_index: None,
            group_id: None,
            position: None,
            transform: None,
        }
    }
}

impl From<&Tomogram> for CatalogItem {
    fn from(tomo: &Tomogram) -> Self {
        let mut item = Self::file(&tomo.file_name);
        item.stack_index = Some(tomo.index);
        item
    }
}

impl From<&SubTomogram> for CatalogItem {
    fn from(subtomo: &SubTomogram) -> Self {
        let mut item = Self::file(&subtomo.file_name);
        item.vol_name = Some(subtomo.vol_name.clone());
        item.class_id = subtomo.class_id;
        item.transform = Some(to_row_major(&subtomo.transform));
        if let Some(coord) = &subtomo.coordinate {
            item.position = Some([coord.x, coord.y, coord.z]);
            item.group_id = coord.group_id.clone();
        }
        item
    }
}

impl From<&Coordinate3D> for CatalogItem {
    fn from(coord: &Coordinate3D) -> Self {
        let mut item = Self::file(&coord.vol_name);
        item.vol_name = Some(coord.vol_name.clone());
        item.group_id = coord.group_id.clone();
        item.position = Some([coord.x, coord.y, coord.z]);
        item.transform = Some(to_row_major(&coord.transform));
        item
    }
}

impl From<&TomoMask> for CatalogItem {
    fn from(mask: &TomoMask) -> Self {
        let mut item = Self::file(&mask.file_name);
        item.vol_name = Some(mask.vol_name.clone());
        item.class_id = mask.class_id;
        item
    }
}

/// A named set produced by a stage, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSet {
    pub name: String,
    pub kind: SetKind,
    pub sampling_rate: f64,
    pub box_size: Option<u32>,
    pub star_file: Option<PathBuf>,
    pub items: Vec<CatalogItem>,
}

impl OutputSet {
    pub fn new<'a, T>(
        name: impl Into<String>,
        kind: SetKind,
        sampling_rate: f64,
        entities: impl IntoIterator<Item = &'a T>,
    ) -> Self
    where
        T: 'a,
        CatalogItem: From<&'a T>,
    {
        Self {
            name: name.into(),
            kind,
            sampling_rate,
            box_size: None,
            star_file: None,
            items: entities.into_iter().map(CatalogItem::from).collect(),
        }
    }
}

/// Stored set summary.
#[derive(Debug, Clone, PartialEq)]
pub struct SetRecord {
    pub id: SetId,
    pub run_id: RunId,
    pub name: String,
    pub kind: SetKind,
    pub sampling_rate: f64,
    pub box_size: Option<u32>,
    pub star_file: Option<PathBuf>,
    pub item_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub id: RunId,
    pub stage: String,
    pub work_dir: PathBuf,
    pub status: RunStatus,
    pub summary: Option<String>,
}

#[derive(Debug)]
pub enum CatalogError {
    Db(DbError),
    Json(serde_json::Error),
    UnknownRun(RunId),
    DuplicateSet { run_id: RunId, name: String },
    InvalidData(String),
}

impl CatalogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Db(err) => err.kind(),
            Self::Json(_) | Self::InvalidData(_) => ErrorKind::Format,
            Self::UnknownRun(_) | Self::DuplicateSet { .. } => ErrorKind::Configuration,
        }
    }
}

impl Display for CatalogError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "catalog json error: {err}"),
            Self::UnknownRun(id) => write!(f, "run not found: {id}"),
            Self::DuplicateSet { run_id, name } => {
                write!(f, "run {run_id} already has an output set named `{name}`")
            }
            Self::InvalidData(message) => write!(f, "invalid catalog data: {message}"),
        }
    }
}

impl Error for CatalogError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for CatalogError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for CatalogError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// SQLite-backed output catalog over a migrated connection.
pub struct OutputCatalog<'conn> {
    conn: &'conn mut Connection,
}

impl<'conn> OutputCatalog<'conn> {
    pub fn new(conn: &'conn mut Connection) -> Self {
        Self { conn }
    }

    /// Records a new run in `running` state.
    pub fn begin_run(
        &self,
        stage: &str,
        work_dir: &Path,
        params: &serde_json::Value,
    ) -> CatalogResult<RunId> {
        let id = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO runs (id, stage, work_dir, params_json, status, started_at)
             VALUES (?1, ?2, ?3, ?4, 'running', strftime('%s', 'now') * 1000);",
            params![
                id.to_string(),
                stage,
                work_dir.display().to_string(),
                serde_json::to_string(params)?
            ],
        )?;
        info!("event=catalog_run module=catalog status=start stage={} run_id={}", stage, id);
        Ok(id)
    }

    /// Persists `set` and its items under `run_id`.
    pub fn register_set(&mut self, run_id: RunId, set: &OutputSet) -> CatalogResult<SetId> {
        self.ensure_run(run_id)?;
        let taken: bool = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM output_sets WHERE run_id = ?1 AND name = ?2);",
            params![run_id.to_string(), set.name],
            |row| row.get(0),
        )?;
        if taken {
            return Err(CatalogError::DuplicateSet {
                run_id,
                name: set.name.clone(),
            });
        }

        let set_id = Uuid::new_v4();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO output_sets
                (id, run_id, name, kind, sampling_rate, box_size, star_file, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, strftime('%s', 'now') * 1000);",
            params![
                set_id.to_string(),
                run_id.to_string(),
                set.name,
                set.kind.as_str(),
                set.sampling_rate,
                set.box_size,
                set.star_file.as_ref().map(|p| p.display().to_string()),
            ],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO set_items
                    (set_id, position, file_name, vol_name, class_id, stack_index, group_id,
                     x, y, z, transform_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11);",
            )?;
            for (position, item) in set.items.iter().enumerate() {
                let transform = item
                    .transform
                    .as_ref()
                    .map(|m| serde_json::to_string(&m.to_vec()))
                    .transpose()?;
                let [x, y, z] = match item.position {
                    Some([x, y, z]) => [Some(x), Some(y), Some(z)],
                    None => [None, None, None],
                };
                insert.execute(params![
                    set_id.to_string(),
                    position as i64,
                    item.file_name,
                    item.vol_name,
                    item.class_id,
                    item.stack_index,
                    item.group_id,
                    x,
                    y,
                    z,
                    transform,
                ])?;
            }
        }
        tx.commit()?;

        info!(
            "event=catalog_set module=catalog status=ok run_id={} set={} kind={} items={}",
            run_id,
            set.name,
            set.kind.as_str(),
            set.items.len()
        );
        Ok(set_id)
    }

    /// Sets of `run_id` in registration order.
    pub fn list_sets(&self, run_id: RunId) -> CatalogResult<Vec<SetRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.name, s.kind, s.sampling_rate, s.box_size, s.star_file,
                    (SELECT COUNT(*) FROM set_items i WHERE i.set_id = s.id) AS item_count
             FROM output_sets s
             WHERE s.run_id = ?1
             ORDER BY s.created_at ASC, s.rowid ASC;",
        )?;
        let mut rows = stmt.query([run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id_text: String = row.get("id")?;
            let kind_text: String = row.get("kind")?;
            let star_file: Option<String> = row.get("star_file")?;
            let item_count: i64 = row.get("item_count")?;
            out.push(SetRecord {
                id: parse_uuid(&id_text)?,
                run_id,
                name: row.get("name")?,
                kind: SetKind::parse(&kind_text).ok_or_else(|| {
                    CatalogError::InvalidData(format!("unknown set kind `{kind_text}`"))
                })?,
                sampling_rate: row.get("sampling_rate")?,
                box_size: row.get("box_size")?,
                star_file: star_file.map(PathBuf::from),
                item_count: item_count.max(0) as u64,
            });
        }
        Ok(out)
    }

    pub fn count_items(&self, set_id: SetId) -> CatalogResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM set_items WHERE set_id = ?1;",
            [set_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Items of one set in insertion order.
    pub fn list_items(&self, set_id: SetId) -> CatalogResult<Vec<CatalogItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_name, vol_name, class_id, stack_index, group_id, x, y, z, transform_json
             FROM set_items WHERE set_id = ?1 ORDER BY position ASC;",
        )?;
        let mut rows = stmt.query([set_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let x: Option<f64> = row.get("x")?;
            let y: Option<f64> = row.get("y")?;
            let z: Option<f64> = row.get("z")?;
            let transform_json: Option<String> = row.get("transform_json")?;
            out.push(CatalogItem {
                file_name: row.get("file_name")?,
                vol_name: row.get("vol_name")?,
                class_id: row.get("class_id")?,
                stack_index: row.get("stack_index")?,
                group_id: row.get("group_id")?,
                position: match (x, y, z) {
                    (Some(x), Some(y), Some(z)) => Some([x, y, z]),
                    _ => None,
                },
                transform: transform_json.as_deref().map(parse_transform).transpose()?,
            });
        }
        Ok(out)
    }

    /// Closes a run with its final status and an optional summary line.
    pub fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        summary: Option<&str>,
    ) -> CatalogResult<()> {
        let changed = self.conn.execute(
            "UPDATE runs
             SET status = ?2, summary = ?3, finished_at = strftime('%s', 'now') * 1000
             WHERE id = ?1;",
            params![run_id.to_string(), status.as_str(), summary],
        )?;
        if changed == 0 {
            return Err(CatalogError::UnknownRun(run_id));
        }
        info!(
            "event=catalog_run module=catalog status={} run_id={}",
            status.as_str(),
            run_id
        );
        Ok(())
    }

    pub fn get_run(&self, run_id: RunId) -> CatalogResult<Option<RunRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT stage, work_dir, status, summary FROM runs WHERE id = ?1;",
                [run_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((stage, work_dir, status, summary)) = row else {
            return Ok(None);
        };
        let status = RunStatus::parse(&status)
            .ok_or_else(|| CatalogError::InvalidData(format!("unknown run status `{status}`")))?;
        Ok(Some(RunRecord {
            id: run_id,
            stage,
            work_dir: PathBuf::from(work_dir),
            status,
            summary,
        }))
    }

    fn ensure_run(&self, run_id: RunId) -> CatalogResult<()> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM runs WHERE id = ?1);",
            [run_id.to_string()],
            |row| row.get(0),
        )?;
        if exists {
            Ok(())
        } else {
            Err(CatalogError::UnknownRun(run_id))
        }
    }
}

fn parse_uuid(value: &str) -> CatalogResult<Uuid> {
    Uuid::parse_str(value).map_err(|err| CatalogError::InvalidData(format!("bad uuid `{value}`: {err}")))
}

fn parse_transform(json: &str) -> CatalogResult<[f64; 16]> {
    let values: Vec<f64> = serde_json::from_str(json)?;
    values
        .try_into()
        .map_err(|values: Vec<f64>| {
            CatalogError::InvalidData(format!("transform has {} values, expected 16", values.len()))
        })
}
