//! Per-connection file transfer session.

use crate::file_manager::FileManager;
use crate::metrics::{
    BYTES_RECEIVED, BYTES_SENT, DOWNLOADS_COMPLETED, DOWNLOADS_STARTED, PROTOCOL_ERRORS,
    UPLOADS_COMPLETED, UPLOADS_STARTED,
};
use crate::protocol::{
    MsgType, NetType, StreamReader, StreamWriter, TransferCode, FRAME_HEADER_LEN, MAX_PACKAGE_SIZE,
};
use evio::{ByteBuffer, TcpConnection, TcpConnectionPtr, Timestamp};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Weak};
use tracing::{error, info, warn};

struct SessionState {
    /// Sequence number echoed from the current request.
    seq: i32,
    /// Open handle for the in-flight upload or download.
    file: Option<File>,
    download_offset: i64,
    download_size: i64,
    uploading: bool,
}

/// Upload/download state machine for one connection.
///
/// Only its connection's worker loop ever calls [`on_read`](Self::on_read),
/// so the state is effectively single-threaded; the lock exists because the
/// session is shared with the server's session map. The connection is held
/// weakly: the session must never keep a closed connection alive.
pub struct FileSession {
    conn: Weak<TcpConnection>,
    manager: Arc<FileManager>,
    state: Mutex<SessionState>,
}

impl FileSession {
    pub fn new(conn: &TcpConnectionPtr, manager: Arc<FileManager>) -> Self {
        FileSession {
            conn: Arc::downgrade(conn),
            manager,
            state: Mutex::new(SessionState {
                seq: 0,
                file: None,
                download_offset: 0,
                download_size: 0,
                uploading: false,
            }),
        }
    }

    /// Extract and process every complete frame in `buffer`.
    pub fn on_read(&self, conn: &TcpConnectionPtr, buffer: &mut ByteBuffer, _when: Timestamp) {
        loop {
            if buffer.readable_bytes() < FRAME_HEADER_LEN {
                return;
            }

            let mut header = [0u8; FRAME_HEADER_LEN];
            header.copy_from_slice(&buffer.peek()[..FRAME_HEADER_LEN]);
            let body_len = i64::from_le_bytes(header);

            if body_len <= 0 || body_len > MAX_PACKAGE_SIZE {
                PROTOCOL_ERRORS.increment();
                error!(
                    peer = %conn.peer_address(),
                    body_len,
                    "illegal frame header, closing connection"
                );
                conn.force_close();
                return;
            }

            if buffer.readable_bytes() < FRAME_HEADER_LEN + body_len as usize {
                return;
            }

            buffer.retrieve(FRAME_HEADER_LEN);
            let body = buffer.peek()[..body_len as usize].to_vec();
            buffer.retrieve(body_len as usize);
            BYTES_RECEIVED.add((FRAME_HEADER_LEN as i64 + body_len) as u64);

            if !self.process(conn, &body) {
                PROTOCOL_ERRORS.increment();
                error!(peer = %conn.peer_address(), "request failed, closing connection");
                // force_close is queued onto the worker loop, so frames
                // already buffered are still parsed before it lands.
                conn.force_close();
            }
        }
    }

    /// Decode one request body and dispatch it. `false` poisons the
    /// connection.
    fn process(&self, conn: &TcpConnectionPtr, body: &[u8]) -> bool {
        let mut reader = StreamReader::new(body);

        let cmd = match reader.read_i32() {
            Ok(cmd) => cmd,
            Err(e) => {
                error!(peer = %conn.peer_address(), error = %e, "bad cmd field");
                return false;
            }
        };
        let seq = match reader.read_i32() {
            Ok(seq) => seq,
            Err(e) => {
                error!(peer = %conn.peer_address(), error = %e, "bad seq field");
                return false;
            }
        };
        self.state.lock().seq = seq;

        let md5 = match reader.read_bytes(64) {
            Ok(bytes) if !bytes.is_empty() => match String::from_utf8(bytes) {
                Ok(md5) => md5,
                Err(_) => {
                    error!(peer = %conn.peer_address(), "md5 is not valid text");
                    return false;
                }
            },
            Ok(_) => {
                error!(peer = %conn.peer_address(), "empty md5");
                return false;
            }
            Err(e) => {
                error!(peer = %conn.peer_address(), error = %e, "bad md5 field");
                return false;
            }
        };

        let (offset, file_size, file_data) = match (
            reader.read_i64(),
            reader.read_i64(),
            reader.read_bytes(0),
        ) {
            (Ok(offset), Ok(file_size), Ok(file_data)) => (offset, file_size, file_data),
            _ => {
                error!(peer = %conn.peer_address(), "truncated request body");
                return false;
            }
        };

        info!(
            cmd,
            seq,
            md5 = %md5,
            offset,
            file_size,
            data_len = file_data.len(),
            peer = %conn.peer_address(),
            "request"
        );

        match MsgType::from_i32(cmd) {
            Some(MsgType::UploadReq) => self.on_upload_chunk(conn, &md5, offset, file_size, &file_data),
            Some(MsgType::DownloadReq) => {
                let net_type = match reader.read_i32() {
                    Ok(value) => NetType::from_i32(value),
                    Err(e) => {
                        error!(peer = %conn.peer_address(), error = %e, "bad net type field");
                        return false;
                    }
                };
                self.on_download_chunk(conn, &md5, net_type)
            }
            _ => {
                error!(cmd, peer = %conn.peer_address(), "unsupported cmd");
                false
            }
        }
    }

    /// Persist one upload chunk and answer with progress or completion.
    fn on_upload_chunk(
        &self,
        conn: &TcpConnectionPtr,
        md5: &str,
        offset: i64,
        file_size: i64,
        data: &[u8],
    ) -> bool {
        let mut state = self.state.lock();

        // A re-upload of a file we already hold short-circuits straight to
        // completion.
        if self.manager.contains(md5) && !state.uploading {
            let seq = state.seq;
            drop(state);
            info!(md5 = %md5, peer = %conn.peer_address(), "duplicate upload short-circuited");
            self.respond(
                conn,
                MsgType::UploadResp,
                seq,
                TransferCode::Complete,
                md5,
                file_size,
                file_size,
                &[],
            );
            return true;
        }

        if offset == 0 {
            let path = self.manager.path_for(md5);
            match File::create(&path) {
                Ok(file) => {
                    state.file = Some(file);
                    state.uploading = true;
                    UPLOADS_STARTED.increment();
                }
                Err(e) => {
                    error!(md5 = %md5, error = %e, "failed to create upload target");
                    return false;
                }
            }
        } else if state.file.is_none() {
            error!(md5 = %md5, offset, "mid-upload chunk without an open file");
            Self::reset_file(&mut state);
            return false;
        }

        {
            let file = state.file.as_mut().expect("upload file must be open");
            if let Err(e) = file
                .seek(SeekFrom::Start(offset as u64))
                .and_then(|_| file.write_all(data))
                .and_then(|_| file.flush())
            {
                error!(md5 = %md5, offset, error = %e, "upload write failed");
                Self::reset_file(&mut state);
                return false;
            }
        }

        let received_through = offset + data.len() as i64;
        let complete = received_through == file_size;
        let (code, reply_offset) = if complete {
            self.manager.add(md5);
            UPLOADS_COMPLETED.increment();
            Self::reset_file(&mut state);
            (TransferCode::Complete, file_size)
        } else {
            (TransferCode::InProgress, offset)
        };
        let seq = state.seq;
        drop(state);

        info!(
            md5 = %md5,
            offset = reply_offset,
            file_size,
            complete,
            peer = %conn.peer_address(),
            "upload chunk stored"
        );
        self.respond(
            conn,
            MsgType::UploadResp,
            seq,
            code,
            md5,
            reply_offset,
            file_size,
            &[],
        );
        true
    }

    /// Serve the next download chunk, sized by the client's link type.
    fn on_download_chunk(&self, conn: &TcpConnectionPtr, md5: &str, net_type: NetType) -> bool {
        let mut state = self.state.lock();
        let seq = state.seq;

        if !self.manager.contains(md5) {
            drop(state);
            warn!(md5 = %md5, peer = %conn.peer_address(), "download of unknown file");
            self.respond(
                conn,
                MsgType::DownloadResp,
                seq,
                TransferCode::NotExist,
                md5,
                0,
                0,
                &[],
            );
            return true;
        }

        if state.file.is_none() {
            let path = self.manager.path_for(md5);
            let file = match OpenOptions::new().read(true).open(&path) {
                Ok(file) => file,
                Err(e) => {
                    error!(md5 = %md5, error = %e, "failed to open download source");
                    return false;
                }
            };
            let size = match file.metadata() {
                Ok(meta) => meta.len() as i64,
                Err(e) => {
                    error!(md5 = %md5, error = %e, "failed to stat download source");
                    return false;
                }
            };
            if size <= 0 {
                error!(md5 = %md5, size, "refusing to serve empty file");
                return false;
            }
            state.file = Some(file);
            state.download_offset = 0;
            state.download_size = size;
            DOWNLOADS_STARTED.increment();
        }

        let mut chunk_len = net_type.chunk_size();
        if state.download_size <= state.download_offset + chunk_len {
            chunk_len = state.download_size - state.download_offset;
        }
        if chunk_len <= 0 {
            error!(
                md5 = %md5,
                offset = state.download_offset,
                size = state.download_size,
                "download cursor ran past the file"
            );
            Self::reset_file(&mut state);
            return false;
        }

        let mut data = vec![0u8; chunk_len as usize];
        {
            let offset = state.download_offset;
            let file = state.file.as_mut().expect("download file must be open");
            if let Err(e) = file
                .seek(SeekFrom::Start(offset as u64))
                .and_then(|_| file.read_exact(&mut data))
            {
                error!(md5 = %md5, offset, error = %e, "download read failed");
                Self::reset_file(&mut state);
                return false;
            }
        }

        let send_offset = state.download_offset;
        state.download_offset += chunk_len;
        let file_size = state.download_size;
        let complete = state.download_offset == state.download_size;
        let code = if complete {
            TransferCode::Complete
        } else {
            TransferCode::InProgress
        };
        if complete {
            DOWNLOADS_COMPLETED.increment();
            Self::reset_file(&mut state);
        }
        drop(state);

        info!(
            md5 = %md5,
            offset = send_offset,
            chunk = chunk_len,
            file_size,
            complete,
            peer = %conn.peer_address(),
            "download chunk served"
        );
        self.respond(
            conn,
            MsgType::DownloadResp,
            seq,
            code,
            md5,
            send_offset,
            file_size,
            &data,
        );
        true
    }

    /// Serialize and send one response frame.
    #[allow(clippy::too_many_arguments)]
    fn respond(
        &self,
        conn: &TcpConnectionPtr,
        msg_type: MsgType,
        seq: i32,
        code: TransferCode,
        md5: &str,
        offset: i64,
        file_size: i64,
        data: &[u8],
    ) {
        let mut writer = StreamWriter::new();
        writer
            .write_i32(msg_type as i32)
            .write_i32(seq)
            .write_i32(code as i32)
            .write_bytes(md5.as_bytes())
            .write_i64(offset)
            .write_i64(file_size)
            .write_bytes(data);
        let frame = writer.into_frame();

        // The session must not extend the connection's life; a send after
        // close is dropped.
        match self.conn.upgrade() {
            Some(strong) => {
                debug_assert!(Arc::ptr_eq(&strong, conn));
                BYTES_SENT.add(frame.len() as u64);
                strong.send(&frame);
            }
            None => warn!("connection gone before response could be sent"),
        }
    }

    fn reset_file(state: &mut SessionState) {
        state.file = None;
        state.download_offset = 0;
        state.download_size = 0;
        state.uploading = false;
    }
}
