// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::path::Path;

use tracing::debug;

use crate::common::status::Status;

/// Filesystem operations used by query finalization. Implementations back
/// this with whatever store the staged INSERT files live on.
pub trait FileSystem: Send + Sync {
    fn move_file(&self, src: &str, dest: &str) -> Status;

    fn delete_file(&self, path: &str) -> Status;
}

/// Local-disk implementation: rename, falling back to copy+delete when the
/// rename crosses filesystems.
#[derive(Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for LocalFileSystem {
    fn move_file(&self, src: &str, dest: &str) -> Status {
        if let Some(parent) = Path::new(dest).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Status::io_error(format!(
                        "create directory {} failed: {}",
                        parent.display(),
                        e
                    ));
                }
            }
        }
        match std::fs::rename(src, dest) {
            Ok(()) => {
                debug!(src, dest, "moved file");
                Status::ok()
            }
            Err(_) => {
                // Cross-device moves cannot be renamed.
                if let Err(e) = std::fs::copy(src, dest) {
                    return Status::io_error(format!("copy {} -> {} failed: {}", src, dest, e));
                }
                if let Err(e) = std::fs::remove_file(src) {
                    return Status::io_error(format!(
                        "remove {} after copy to {} failed: {}",
                        src, dest, e
                    ));
                }
                debug!(src, dest, "moved file (copy+delete)");
                Status::ok()
            }
        }
    }

    fn delete_file(&self, path: &str) -> Status {
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!(path, "deleted file");
                Status::ok()
            }
            Err(e) => Status::io_error(format!("delete {} failed: {}", path, e)),
        }
    }
}
