//! # Host Imports
//!
//! The `env` functions a module links against. `get_data` and `set_data`
//! reach into the `DataStore` and therefore suspend through the bridge;
//! `logstr` is synchronous.

use std::sync::Arc;

use crate::asyncify::AsyncCallState;
use crate::asyncify::Host;
use crate::asyncify::ImportResult;
use crate::store::DataStore;

/// Longest run read from memory at a time while looking for a terminator.
const SCAN_CHUNK: usize = 256;

/// What the imports need beyond the bridge primitives.
pub trait EnvHost: Host {
    fn data_store(&self) -> Arc<dyn DataStore>;

    /// Value of the `logger` field on lines the module logs.
    fn logger_name(&self) -> &str;

    /// Export used to allocate the buffer `get_data` hands back.
    fn malloc_export(&self) -> &str;
}

/// `logstr(addr)`: logs a NUL-terminated string from module memory.
pub fn logstr<H: EnvHost>(host: &mut H, addr: u32) -> wasmtime::Result<()> {
    let message = read_c_string(host, addr)?;
    let megabytes = host.memory_size() as f64 / (1024.0 * 1024.0);
    tracing::info!(logger = host.logger_name(), "{} (mem: {:.2}MiB)", message, megabytes);
    Ok(())
}

/// `get_data(keyAddr, lengthOutAddr) -> dataAddr`.
///
/// Missing keys write a length of 0 and return 0. Otherwise the value is
/// copied into a fresh module allocation and its length is written to
/// `length_out_addr`.
pub fn get_data<H: EnvHost>(host: &mut H, key_addr: u32, length_out_addr: u32) -> wasmtime::Result<u32> {
    AsyncCallState::wrap_import(host, "get_data", |host, state| {
        let key = read_c_string(host, key_addr)?;

        if !state.continuation {
            tracing::debug!(logger = host.logger_name(), key = %key, "get_data");
            let store = host.data_store();
            return Ok(ImportResult::Deferred(Box::pin(async move { store.get(&key).await })));
        }

        let Some(data) = state.result else {
            host.write_bytes(&0u32.to_le_bytes(), length_out_addr)?;
            tracing::debug!(logger = host.logger_name(), key = %key, "get_data: no data found");
            return Ok(ImportResult::Ready(0));
        };

        let length = u32::try_from(data.len())?;
        let malloc = host.malloc_export().to_string();
        let data_addr = host.call(&malloc, &[length])?;
        if data_addr == 0 && length > 0 {
            anyhow::bail!("{} failed to allocate {} bytes", malloc, length);
        }
        host.write_bytes(&length.to_le_bytes(), length_out_addr)?;
        host.write_bytes(&data, data_addr)?;
        tracing::debug!(logger = host.logger_name(), key = %key, length, data_addr, "get_data: data returned");
        Ok(ImportResult::Ready(data_addr))
    })
}

/// `set_data(keyAddr, dataAddr, length)`: stores a copy of the given range.
pub fn set_data<H: EnvHost>(host: &mut H, key_addr: u32, data_addr: u32, length: u32) -> wasmtime::Result<()> {
    AsyncCallState::wrap_import(host, "set_data", |host, state| {
        if state.continuation {
            return Ok(ImportResult::Ready(0));
        }

        let key = read_c_string(host, key_addr)?;
        let Some(end) = data_addr.checked_add(length) else {
            anyhow::bail!("set_data range {}+{} overflows memory", data_addr, length);
        };
        let value = host.read_bytes(data_addr, end)?;
        tracing::debug!(logger = host.logger_name(), key = %key, length, "set_data");

        let store = host.data_store();
        Ok(ImportResult::Deferred(Box::pin(async move {
            store.set(&key, value).await.map(|()| None)
        })))
    })?;
    Ok(())
}

/// Reads bytes from `addr` up to the first NUL, decoding as lossy UTF-8.
pub fn read_c_string<H: Host>(host: &mut H, addr: u32) -> wasmtime::Result<String> {
    let limit = host.memory_size().min(u32::MAX as usize);
    let mut bytes = Vec::new();
    let mut cursor = addr as usize;

    loop {
        if cursor >= limit {
            anyhow::bail!("unterminated string at {}", addr);
        }
        let end = (cursor + SCAN_CHUNK).min(limit);
        let chunk = host.read_bytes(cursor as u32, end as u32)?;
        if let Some(nul) = chunk.iter().position(|b| *b == 0) {
            bytes.extend_from_slice(&chunk[..nul]);
            break;
        }
        bytes.extend_from_slice(&chunk);
        cursor = end;
    }

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
