//! Source of the sandboxed child process the host's `REPLProcess` spawns
//! in container mode. This is wire-protocol glue, not orchestration logic
//! — the orchestration (iteration loop, history budgeting, namespace
//! contract) lives entirely in `rlm::runner`/`rlm::history` on the host
//! side; the child merely hosts a persistent namespace and speaks
//! JSON-RPC over stdio, the same way `codex` is an external collaborator
//! the host shells out to in `backend::subprocess`.

/// Embedded as a literal so no file needs to ship alongside the binary;
/// written to a temp file and invoked as `python3 <path>` by
/// `rlm::repl::REPLProcess::start`.
pub const CHILD_SCRIPT: &str = r#"
import json
import sys
import traceback
import uuid
import io
from contextlib import redirect_stdout, redirect_stderr

_pending = {}

class FinalAnswer(Exception):
    def __init__(self, answer):
        self.answer = answer

def _send(obj):
    sys.stdout.write(json.dumps(obj) + "\n")
    sys.stdout.flush()

def _call_host(method, params):
    call_id = str(uuid.uuid4())
    _send({"jsonrpc": "2.0", "id": call_id, "method": method, "params": params})
    while True:
        line = sys.stdin.readline()
        if not line:
            raise RuntimeError("host closed stdin during callback")
        msg = json.loads(line)
        if msg.get("id") == call_id and ("result" in msg or "error" in msg):
            if "error" in msg:
                raise RuntimeError(msg["error"].get("message", "host error"))
            return msg["result"]
        # Any other inbound line while awaiting a callback response is
        # logged and ignored; the protocol is strictly request/response
        # per in-flight callback.

def llm_query(prompt, model="haiku", **kwargs):
    if "context" in kwargs:
        prompt = prompt + "\n" + str(kwargs.pop("context"))
    return _call_host("llm_query", {"prompt": prompt, "model": model})

def llm_query_parallel(prompts, model="haiku"):
    return _call_host("llm_query_parallel", {"prompts": prompts, "model": model})

def FINAL(answer):
    raise FinalAnswer(str(answer))

def FINAL_VAR(name):
    if name not in _namespace:
        raise NameError(f"FINAL_VAR: no variable named {name!r} in namespace")
    raise FinalAnswer(str(_namespace[name]))

_namespace = {
    "llm_query": llm_query,
    "llm_query_parallel": llm_query_parallel,
    "FINAL": FINAL,
    "FINAL_VAR": FINAL_VAR,
    "files_containing": lambda pattern: _call_host("files_containing", {"pattern": pattern}),
    "files_importing": lambda module: _call_host("files_importing", {"module": module}),
    "file_exists": lambda path: _call_host("file_exists", {"path": path}),
    "list_files_matching": lambda pattern: _call_host("list_files_matching", {"pattern": pattern}),
    "get_file_slice": lambda path, start, end: _call_host(
        "get_file_slice", {"path": path, "start": start, "end": end}
    ),
}

def _execute(code):
    stdout_buf, stderr_buf = io.StringIO(), io.StringIO()
    try:
        with redirect_stdout(stdout_buf), redirect_stderr(stderr_buf):
            exec(code, _namespace, _namespace)
        output = stdout_buf.getvalue() + stderr_buf.getvalue()
        return {"output": output, "error": None, "final_answer": None}
    except FinalAnswer as fa:
        return {"output": stdout_buf.getvalue(), "error": None, "final_answer": fa.answer}
    except SystemExit as se:
        return {"output": stdout_buf.getvalue(), "error": f"SystemExit: {se}", "final_answer": None}
    except Exception:
        return {"output": stdout_buf.getvalue(), "error": traceback.format_exc(), "final_answer": None}

def main():
    for line in sys.stdin:
        line = line.strip()
        if not line:
            continue
        msg = json.loads(line)
        if msg.get("method") == "execute":
            result = _execute(msg["params"]["code"])
            _send({"jsonrpc": "2.0", "id": msg["id"], "result": result})
        elif msg.get("method") == "ping":
            _send({"jsonrpc": "2.0", "id": msg["id"], "result": {"pong": True}})
        else:
            _send({
                "jsonrpc": "2.0",
                "id": msg.get("id"),
                "error": {"code": -32601, "message": "method not found"},
            })

if __name__ == "__main__":
    main()
"#;
