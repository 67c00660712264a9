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
use std::fmt;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StatusCode {
    Ok,
    Cancelled,
    InternalError,
    IoError,
    NotFound,
    RemoteError,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::InternalError => "INTERNAL_ERROR",
            StatusCode::IoError => "IO_ERROR",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::RemoteError => "REMOTE_ERROR",
        };
        f.write_str(s)
    }
}

/// Result of an operation, or the overall state of a query.
///
/// The coordinator's query status cell is a `Status` that transitions at
/// most once from OK to a non-OK value; the first error wins.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Status {
    code: StatusCode,
    message: Option<String>,
}

impl Status {
    pub const OK: Status = Status {
        code: StatusCode::Ok,
        message: None,
    };

    pub fn ok() -> Status {
        Status::OK
    }

    pub fn new(code: StatusCode, message: impl Into<String>) -> Status {
        Status {
            code,
            message: Some(message.into()),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Status {
        Status::new(StatusCode::Cancelled, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Status {
        Status::new(StatusCode::InternalError, message)
    }

    pub fn io_error(message: impl Into<String>) -> Status {
        Status::new(StatusCode::IoError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Status {
        Status::new(StatusCode::NotFound, message)
    }

    pub fn remote_error(message: impl Into<String>) -> Status {
        Status::new(StatusCode::RemoteError, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == StatusCode::Cancelled
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Turns an OK status into `Ok(())` and an error status into `Err(self)`.
    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::OK
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.code, msg),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for Status {}

pub type Result<T> = std::result::Result<T, Status>;
