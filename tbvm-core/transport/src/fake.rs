//! 内存中的 Guest Agent 模拟
//!
//! 按 QEMU Guest Agent 的 JSON 协议应答 guest-ping / guest-exec / guest-exec-status /
//! guest-file-* 命令，并记录收到的每一条请求，供测试断言。

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Value};

use crate::{GuestChannel, HypervisorError, Result};

/// 预置的 Guest 程序输出
#[derive(Debug, Clone, Default)]
pub struct FakeProgram {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug)]
struct FakeProcess {
    remaining_polls: u32,
    capture: bool,
    program: FakeProgram,
}

#[derive(Debug)]
struct OpenFile {
    path: String,
    position: usize,
    writable: bool,
}

/// 模拟的 Guest Agent
#[derive(Debug, Default)]
pub struct FakeGuest {
    unreachable: Cell<bool>,
    polls_before_exit: Cell<u32>,
    next_id: Cell<i64>,
    files: RefCell<BTreeMap<String, Vec<u8>>>,
    dirs: RefCell<BTreeSet<String>>,
    programs: RefCell<HashMap<String, FakeProgram>>,
    processes: RefCell<HashMap<i64, FakeProcess>>,
    handles: RefCell<HashMap<i64, OpenFile>>,
    closed: RefCell<Vec<i64>>,
    requests: RefCell<Vec<Value>>,
}

impl FakeGuest {
    /// 新建的 Guest 只有 `/root` 一个目录
    pub fn new() -> Self {
        let guest = Self::default();
        guest.next_id.set(1000);
        guest.add_directory("/root");
        guest
    }

    /// 模拟 Guest Agent 未连接
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.set(unreachable);
    }

    /// 进程在被查询多少次 guest-exec-status 之后才报告退出
    pub fn set_polls_before_exit(&self, polls: u32) {
        self.polls_before_exit.set(polls);
    }

    pub fn add_program(&self, path: &str, program: FakeProgram) {
        self.programs.borrow_mut().insert(path.to_string(), program);
    }

    pub fn add_directory(&self, path: &str) {
        let absolute = path.starts_with('/');
        let mut dirs = self.dirs.borrow_mut();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() || absolute {
                current.push('/');
            }
            current.push_str(part);
            dirs.insert(current.clone());
        }
    }

    pub fn put_file(&self, path: &str, bytes: &[u8]) {
        self.files.borrow_mut().insert(path.to_string(), bytes.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.borrow().get(path).cloned()
    }

    pub fn has_directory(&self, path: &str) -> bool {
        self.dirs.borrow().contains(path)
    }

    /// 仍处于打开状态的文件句柄数
    pub fn open_handles(&self) -> usize {
        self.handles.borrow().len()
    }

    /// 按关闭顺序记录的文件句柄
    pub fn closed_handles(&self) -> Vec<i64> {
        self.closed.borrow().clone()
    }

    /// 收到的全部请求（已解析为 JSON）
    pub fn requests(&self) -> Vec<Value> {
        self.requests.borrow().clone()
    }

    /// 某个命令被调用的次数
    pub fn count(&self, execute: &str) -> usize {
        self.requests
            .borrow()
            .iter()
            .filter(|r| r["execute"] == execute)
            .count()
    }

    fn next_id(&self) -> i64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn parent_exists(&self, path: &str) -> bool {
        match path.rsplit_once('/') {
            Some((parent, _)) if !parent.is_empty() => self.has_directory(parent),
            _ => true,
        }
    }

    fn run_program(&self, path: &str, args: &[String]) -> FakeProgram {
        match path {
            "mkdir" => {
                for dir in args.iter().filter(|a| !a.starts_with('-')) {
                    self.add_directory(dir);
                }
                FakeProgram::default()
            }
            "echo" => FakeProgram {
                stdout: format!("{}\n", args.join(" ")),
                ..Default::default()
            },
            "chmod" => FakeProgram::default(),
            _ => self.programs.borrow().get(path).cloned().unwrap_or(FakeProgram {
                stderr: format!("{}: not found\n", path),
                exit_code: 127,
                ..Default::default()
            }),
        }
    }

    fn handle(&self, execute: &str, args: &Value) -> Result<Value> {
        match execute {
            "guest-ping" => Ok(json!({})),
            "guest-exec" => {
                let path = args["path"]
                    .as_str()
                    .ok_or_else(|| fail("guest-exec 缺少 path"))?;
                let argv: Vec<String> = args["arg"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                let capture = args["capture-output"].as_bool().unwrap_or(false);
                let program = self.run_program(path, &argv);
                let pid = self.next_id();
                self.processes.borrow_mut().insert(
                    pid,
                    FakeProcess {
                        remaining_polls: self.polls_before_exit.get(),
                        capture,
                        program,
                    },
                );
                Ok(json!({ "pid": pid }))
            }
            "guest-exec-status" => {
                let pid = args["pid"].as_i64().ok_or_else(|| fail("缺少 pid"))?;
                let mut processes = self.processes.borrow_mut();
                let process = processes
                    .get_mut(&pid)
                    .ok_or_else(|| fail(&format!("未知进程 {}", pid)))?;
                if process.remaining_polls > 0 {
                    process.remaining_polls -= 1;
                    return Ok(json!({ "exited": false }));
                }
                let mut status = json!({ "exited": true, "exitcode": process.program.exit_code });
                if process.capture {
                    status["out-data"] =
                        json!(general_purpose::STANDARD.encode(&process.program.stdout));
                    status["err-data"] =
                        json!(general_purpose::STANDARD.encode(&process.program.stderr));
                }
                Ok(status)
            }
            "guest-file-open" => {
                let path = args["path"].as_str().ok_or_else(|| fail("缺少 path"))?;
                let mode = args["mode"].as_str().unwrap_or("r");
                let writable = mode.starts_with('w');
                if writable {
                    if !self.parent_exists(path) {
                        return Err(fail(&format!("failed to open file '{}': No such file or directory", path)));
                    }
                    self.files.borrow_mut().insert(path.to_string(), Vec::new());
                } else if !self.files.borrow().contains_key(path) {
                    return Err(fail(&format!("failed to open file '{}': No such file or directory", path)));
                }
                let handle = self.next_id();
                self.handles.borrow_mut().insert(
                    handle,
                    OpenFile {
                        path: path.to_string(),
                        position: 0,
                        writable,
                    },
                );
                Ok(json!(handle))
            }
            "guest-file-write" => {
                let handle = args["handle"].as_i64().ok_or_else(|| fail("缺少 handle"))?;
                let encoded = args["buf-b64"].as_str().ok_or_else(|| fail("缺少 buf-b64"))?;
                let bytes = general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| fail(&format!("无效的 base64: {}", e)))?;
                let handles = self.handles.borrow();
                let file = handles
                    .get(&handle)
                    .filter(|f| f.writable)
                    .ok_or_else(|| fail(&format!("无效的写句柄 {}", handle)))?;
                self.files
                    .borrow_mut()
                    .entry(file.path.clone())
                    .or_default()
                    .extend_from_slice(&bytes);
                Ok(json!({ "count": bytes.len(), "eof": false }))
            }
            "guest-file-read" => {
                let handle = args["handle"].as_i64().ok_or_else(|| fail("缺少 handle"))?;
                let count = args["count"].as_u64().unwrap_or(4096) as usize;
                let mut handles = self.handles.borrow_mut();
                let file = handles
                    .get_mut(&handle)
                    .ok_or_else(|| fail(&format!("无效的读句柄 {}", handle)))?;
                let files = self.files.borrow();
                let content = files.get(&file.path).map(Vec::as_slice).unwrap_or_default();
                let end = (file.position + count).min(content.len());
                let chunk = &content[file.position..end];
                file.position = end;
                Ok(json!({
                    "count": chunk.len(),
                    "buf-b64": general_purpose::STANDARD.encode(chunk),
                    "eof": end >= content.len(),
                }))
            }
            "guest-file-close" => {
                let handle = args["handle"].as_i64().ok_or_else(|| fail("缺少 handle"))?;
                self.handles
                    .borrow_mut()
                    .remove(&handle)
                    .ok_or_else(|| fail(&format!("无效的句柄 {}", handle)))?;
                self.closed.borrow_mut().push(handle);
                Ok(json!({}))
            }
            other => Err(fail(&format!("未知命令 {}", other))),
        }
    }
}

fn fail(message: &str) -> HypervisorError {
    HypervisorError::Libvirt(format!("internal error: {}", message))
}

impl GuestChannel for FakeGuest {
    fn agent_command(&self, command: &str) -> Result<String> {
        let request: Value = serde_json::from_str(command)
            .map_err(|e| fail(&format!("无效的 JSON: {}", e)))?;
        self.requests.borrow_mut().push(request.clone());

        if self.unreachable.get() {
            return Err(HypervisorError::AgentUnresponsive(
                "Guest agent is not responding".to_string(),
            ));
        }

        let execute = request["execute"].as_str().unwrap_or_default().to_string();
        let ret = self.handle(&execute, &request["arguments"])?;
        Ok(json!({ "return": ret }).to_string())
    }
}
