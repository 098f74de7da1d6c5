//! `file:` objects: one data file managed by the block manager.

use tracing::{debug, info};

use tierdb_core::config_string::ConfigString;
use tierdb_core::error::{Error, Result};
use tierdb_core::types::{BtreeVersion, HS_URI, TIERED_OBJECT_SUFFIX};
use tierdb_core::utils::align_to;

use super::{merge_stack, without_keys, ObjectCreator, CREATE_ONLY_KEYS, FILE_META_DEFAULTS};
use crate::block::CheckpointDescriptor;
use crate::connection::ConnectionInner;
use crate::session::Session;

pub(super) struct FileCreator;

impl ObjectCreator for FileCreator {
    fn create(&self, session: &mut Session, uri: &str, exclusive: bool, config: &str) -> Result<()> {
        let conn = session.conn_arc();
        let import = session.import.active;
        let filename = uri
            .strip_prefix("file:")
            .ok_or_else(|| Error::invalid(format!("{}: expected a file: URI", uri)))?;

        if conn.metadata.exists(uri) {
            // Importing over an existing object is always an error.
            if exclusive || import {
                return Err(Error::exists(uri));
            }
            return Ok(());
        }

        // A history store file left on disk without metadata is stale.
        if uri == HS_URI && conn.fs().exists(filename).unwrap_or(false) {
            let _ = conn.fs().remove(filename);
            info!("removed stray history store file {}", filename);
        }

        let user = ConfigString::parse(config)?;
        let base = merge_stack(&[FILE_META_DEFAULTS, config])?;
        let allocsize = direct_io_size_check(&conn, &base, "allocation_size")?;

        let mut file_metadata: Option<String> = None;
        let mut repair = false;
        if import {
            if filename.ends_with(TIERED_OBJECT_SUFFIX) {
                if session.import.list.is_none() {
                    return Err(Error::not_supported(format!(
                        "{}: import without metadata_file not supported on tiered files",
                        uri
                    )));
                }
                // The import switched to a new local generation; it starts empty.
                if !conn.fs().exists(filename)? {
                    create_block_file(session, &conn, uri, filename, allocsize, &base)?;
                }
            }

            if !conn.fs().exists(filename)? {
                return Err(Error::no_entry(uri.to_string()));
            }

            repair = user.get_bool("import.repair").unwrap_or(false);
            if !repair {
                match user.get("import.file_metadata").filter(|v| !v.is_empty()) {
                    Some(meta) => {
                        let meta = meta.as_string();
                        if ConfigString::parse(&meta)?.get_bool("tiered_object") == Some(true) {
                            return Err(Error::not_supported(format!("{}: import not supported on tiered files", uri)));
                        }
                        file_metadata = Some(meta);
                    }
                    None => match &session.import.list {
                        Some(list) => file_metadata = list.find(uri).ok().map(str::to_string),
                        None => {
                            return Err(Error::invalid(format!(
                                "{}: import requires that 'file_metadata' or 'metadata_file' is specified or the \
                                 'repair' option is provided",
                                uri
                            )))
                        }
                    },
                }
            }
        } else {
            create_block_file(session, &conn, uri, filename, allocsize, &base)?;
        }

        let fileconf = if repair {
            let desc = conn.blocks.read(filename)?;
            let id_cfg = format!("id={},checkpoint_lsn=", conn.allocate_file_id());
            merge_stack(&[FILE_META_DEFAULTS, &desc.repair_config(), &id_cfg])?
        } else {
            let user = without_keys(&user, CREATE_ONLY_KEYS).to_string();
            let mut stack = vec![FILE_META_DEFAULTS.to_string(), user];
            // Entries from an export list already carry a remapped id.
            let keep_id = session.import.list.is_some()
                && file_metadata
                    .as_deref()
                    .and_then(|m| ConfigString::parse(m).ok())
                    .and_then(|m| m.get_int("id"))
                    .is_some();
            if let Some(meta) = &file_metadata {
                stack.push(meta.clone());
            }
            let mut tail = ConfigString::new();
            if !keep_id {
                tail.set_int("id", conn.allocate_file_id() as i64);
            }
            let version = BtreeVersion::CURRENT;
            tail.set_int("version.major", version.major as i64);
            tail.set_int("version.minor", version.minor as i64);
            tail.set_str("checkpoint_lsn", "");
            stack.push(tail.to_string());
            let refs: Vec<&str> = stack.iter().map(String::as_str).collect();
            let mut merged = merge_stack(&refs)?;
            // A new file records the size it was created with; imported
            // metadata already describes the file on disk.
            if !import {
                merged.set_int("allocation_size", allocsize as i64);
            }
            merged
        };
        let fileconf = fileconf.to_string();

        conn.metadata.insert(uri, &fileconf)?;
        session.track.insert(uri);

        if import && session.import.list.is_none() {
            let against_stable = matches!(
                user.get_str("import.compare_timestamp").as_deref(),
                Some("stable") | Some("stable_timestamp")
            );
            check_imported_ts(&conn, uri, &fileconf, against_stable)?;
        }

        if import {
            let desc = conn.blocks.read(filename)?;
            conn.records.load(uri, desc.payload.rows);
            session.track.records(uri);
        }

        let guard = conn.dhandles.try_exclusive(uri, session.id())?;
        session.track.handle_lock(guard);
        debug!("created {} allocsize={} import={}", uri, allocsize, import);
        Ok(())
    }
}

fn create_block_file(
    session: &mut Session,
    conn: &ConnectionInner,
    uri: &str,
    filename: &str,
    allocsize: u32,
    base: &ConfigString,
) -> Result<()> {
    let key_format = base.get_str("key_format").unwrap_or_else(|| "u".to_string());
    let value_format = base.get_str("value_format").unwrap_or_else(|| "u".to_string());
    conn.blocks.create(filename, allocsize, &key_format, &value_format)?;
    // Imported data files are never removed on failure; only files created here are.
    if !session.import.active {
        session.track.file_create(filename);
    }
    debug!("block manager created {} for {}", filename, uri);
    Ok(())
}

/// With direct I/O, sizes must be at least the buffer alignment and a multiple
/// of it. Smaller sizes are raised to the alignment.
pub(crate) fn direct_io_size_check(conn: &ConnectionInner, cfg: &ConfigString, name: &str) -> Result<u32> {
    let value = cfg
        .get_int(name)
        .ok_or_else(|| Error::invalid(format!("missing {} configuration", name)))?;
    let mut size =
        u32::try_from(value).map_err(|_| Error::invalid(format!("{} out of range: {}", name, value)))?;

    let alignment = conn.config.buffer_alignment;
    if alignment != 0 && conn.config.direct_io {
        if size < alignment {
            size = alignment;
        }
        if align_to(size as u64, alignment as u64) != size as u64 {
            return Err(Error::invalid(format!(
                "when direct I/O is configured for data files, the {} size must be at least as large as the \
                 buffer alignment, as well as a multiple of the buffer alignment",
                name
            )));
        }
    }
    Ok(size)
}

/// Refuse imported files whose checkpoints carry timestamps newer than the
/// oldest (or stable) timestamp: a later rollback to stable could lose data.
fn check_imported_ts(conn: &ConnectionInner, uri: &str, fileconf: &str, against_stable: bool) -> Result<()> {
    let cfg = ConfigString::parse(fileconf)?;
    let checkpoints = CheckpointDescriptor::from_config(&cfg);
    if checkpoints.is_empty() {
        return Err(Error::invalid(format!(
            "{}: import could not find any checkpoint information in supplied metadata",
            uri
        )));
    }

    let (ts_name, ts) = {
        let timestamps = conn.timestamps.lock();
        if against_stable {
            ("stable", timestamps.stable)
        } else {
            ("oldest", timestamps.oldest)
        }
    };

    for ckpt in &checkpoints {
        if ckpt.newest_start_durable_ts > ts {
            return Err(Error::rollback(format!(
                "{}: import found aggregated newest start durable timestamp newer than the current {} \
                 timestamp, newest_start_durable_ts={}, {}_ts={}",
                uri, ts_name, ckpt.newest_start_durable_ts, ts_name, ts
            )));
        }
        if ckpt.newest_stop_durable_ts > ts {
            return Err(Error::rollback(format!(
                "{}: import found aggregated newest stop durable timestamp newer than the current {} \
                 timestamp, newest_stop_durable_ts={}, {}_ts={}",
                uri, ts_name, ckpt.newest_stop_durable_ts, ts_name, ts
            )));
        }
    }
    Ok(())
}
