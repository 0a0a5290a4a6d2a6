//! Interactive shell.
//!
//! A line editor over the keyboard event stream plus a command dispatcher.
//! Built-ins cover filesystem navigation, process and memory diagnostics,
//! and the Cupid toolchain (`cc`, `asm`, `exec`). A trailing `&` runs a
//! program as a background job; the job table is polled between input
//! lines so completions get announced.
//!
//! All I/O goes through [`ShellIo`], which keeps the dispatcher testable
//! against a scripted console.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::drivers::keyboard::{KeyEvent, SpecialKey};
use crate::fs::{self, NodeKind, VfsNode};
use crate::process::{self, Pid, ProcessState};

/// Console the shell talks through.
pub trait ShellIo {
    fn write(&mut self, text: &str);
    /// Blocking read of the next key event.
    fn read_key(&mut self) -> KeyEvent;
}

struct Job {
    pid: Pid,
    name: String,
}

pub struct Shell<IO: ShellIo> {
    io: IO,
    jobs: Vec<Job>,
}

const PROMPT: &str = "cupid> ";

impl<IO: ShellIo> Shell<IO> {
    pub fn new(io: IO) -> Self {
        Self {
            io,
            jobs: Vec::new(),
        }
    }

    pub fn io(&mut self) -> &mut IO {
        &mut self.io
    }

    /// The interactive loop. Never returns on hardware.
    pub fn run(&mut self) {
        self.io.write("CupidOS shell. Type 'help' for commands.\n");
        loop {
            self.poll_jobs();
            self.io.write(PROMPT);
            let line = self.read_line();
            self.dispatch(&line);
        }
    }

    // -- line editor ------------------------------------------------------

    /// Read one line with backspace and left/right cursor support. The
    /// whole line is re-rendered after each edit via carriage return.
    pub fn read_line(&mut self) -> String {
        let mut buf: Vec<char> = Vec::new();
        let mut cursor = 0usize;
        let mut rendered_len = 0usize;

        loop {
            let event = self.io.read_key();
            if !event.pressed {
                continue;
            }

            match (event.character, event.special) {
                (Some('\n'), _) | (Some('\r'), _) => {
                    self.io.write("\n");
                    return buf.iter().collect();
                }
                (Some('\u{8}'), _) | (Some('\u{7f}'), _) => {
                    if cursor > 0 {
                        cursor -= 1;
                        buf.remove(cursor);
                    }
                }
                (Some(ch), _) if !ch.is_control() => {
                    buf.insert(cursor, ch);
                    cursor += 1;
                }
                (_, Some(SpecialKey::ArrowLeft)) => cursor = cursor.saturating_sub(1),
                (_, Some(SpecialKey::ArrowRight)) => cursor = (cursor + 1).min(buf.len()),
                (_, Some(SpecialKey::Home)) => cursor = 0,
                (_, Some(SpecialKey::End)) => cursor = buf.len(),
                (_, Some(SpecialKey::Delete)) => {
                    if cursor < buf.len() {
                        buf.remove(cursor);
                    }
                }
                _ => continue,
            }

            // Re-render: prompt + buffer, blank out any leftover tail.
            let line: String = buf.iter().collect();
            let mut repaint = String::from("\r");
            repaint.push_str(PROMPT);
            repaint.push_str(&line);
            for _ in line.len()..rendered_len {
                repaint.push(' ');
            }
            for _ in 0..rendered_len.max(line.len()) - cursor {
                repaint.push('\u{8}');
            }
            rendered_len = line.len();
            self.io.write(&repaint);
        }
    }

    // -- jobs -------------------------------------------------------------

    fn poll_jobs(&mut self) {
        let mut finished = Vec::new();
        self.jobs.retain(|job| {
            if process::is_alive(job.pid) {
                true
            } else {
                finished.push((job.pid, job.name.clone()));
                false
            }
        });
        for (pid, name) in finished {
            let code = process::take_exit_code(pid).unwrap_or(0);
            self.io
                .write(&format!("[job] {} (pid {}) exited with {}\n", name, pid, code));
        }
    }

    // -- dispatch ---------------------------------------------------------

    /// Run one command line; returns its exit code.
    pub fn dispatch(&mut self, line: &str) -> i32 {
        let line = line.trim();
        if line.is_empty() {
            return 0;
        }
        let (line, background) = match line.strip_suffix('&') {
            Some(rest) => (rest.trim(), true),
            None => (line, false),
        };

        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else { return 0 };
        let args: Vec<&str> = parts.collect();

        match cmd {
            "help" => self.cmd_help(),
            "echo" => self.cmd_echo(&args),
            "cat" => self.cmd_cat(&args),
            "ls" => self.cmd_ls(&args),
            "stat" => self.cmd_stat(&args),
            "rm" => self.cmd_rm(&args),
            "mkdir" => self.cmd_mkdir(&args),
            "touch" => self.cmd_touch(&args),
            "cd" => self.cmd_cd(&args),
            "pwd" => self.cmd_pwd(),
            "ps" => self.cmd_ps(),
            "kill" => self.cmd_kill(&args),
            "free" => self.cmd_free(),
            "heap" => self.cmd_heap(),
            "leaks" => self.cmd_leaks(&args),
            "uptime" => self.cmd_uptime(),
            "irqs" => self.cmd_irqs(),
            "jobs" => self.cmd_jobs(),
            "sync" => self.cmd_sync(),
            "clear" => self.cmd_clear(),
            "cc" => self.cmd_cc(&args, background),
            "asm" => self.cmd_asm(&args),
            "exec" => self.cmd_exec(&args, background),
            other => self.cmd_external(other, &args, background),
        }
    }

    fn cmd_help(&mut self) -> i32 {
        self.io.write(
            "built-ins:\n\
             \x20 help                 this text\n\
             \x20 echo TEXT [> FILE]   print text (or write it to FILE)\n\
             \x20 cat FILE             print a file\n\
             \x20 ls [DIR]             list a directory\n\
             \x20 stat PATH            show size and kind\n\
             \x20 rm PATH              remove a file or empty directory\n\
             \x20 mkdir DIR            create a directory\n\
             \x20 touch FILE           create an empty file\n\
             \x20 cd DIR / pwd         change / print working directory\n\
             \x20 ps / kill PID        process table / terminate\n\
             \x20 free / heap / leaks  memory diagnostics\n\
             \x20 uptime / irqs        timers and interrupt counters\n\
             \x20 cc SRC [-o OUT]      compile CupidC (JIT, or ELF with -o)\n\
             \x20 asm SRC [-o OUT]     assemble CupidASM\n\
             \x20 exec BIN [ARGS]      run an ELF program (& = background)\n\
             \x20 jobs / sync / clear\n",
        );
        0
    }

    fn cmd_echo(&mut self, args: &[&str]) -> i32 {
        if let Some(pos) = args.iter().position(|&a| a == ">") {
            let text = args[..pos].join(" ");
            let Some(path) = args.get(pos + 1) else {
                self.io.write("echo: missing redirection target\n");
                return 1;
            };
            let data = format!("{}\n", text);
            let result = {
                let vfs = fs::get_vfs().read();
                fs::write_all(&vfs, path, data.as_bytes())
            };
            match result {
                Ok(_) => 0,
                Err(e) => {
                    self.io.write(&format!("echo: {}: {}\n", path, e));
                    1
                }
            }
        } else {
            self.io.write(&args.join(" "));
            self.io.write("\n");
            0
        }
    }

    fn cmd_cat(&mut self, args: &[&str]) -> i32 {
        let Some(path) = args.first() else {
            self.io.write("cat: missing path\n");
            return 1;
        };
        let result = {
            let vfs = fs::get_vfs().read();
            fs::read_all(&vfs, path)
        };
        match result {
            Ok(data) => {
                match core::str::from_utf8(&data) {
                    Ok(text) => self.io.write(text),
                    Err(_) => self.io.write(&format!("cat: {}: binary file ({} bytes)\n", path, data.len())),
                }
                0
            }
            Err(e) => {
                self.io.write(&format!("cat: {}: {}\n", path, e));
                1
            }
        }
    }

    fn cmd_ls(&mut self, args: &[&str]) -> i32 {
        let path = args.first().copied().unwrap_or(".");
        let entries = {
            let vfs = fs::get_vfs().read();
            vfs.resolve(path).and_then(|node| node.readdir())
        };
        match entries {
            Ok(entries) => {
                for entry in entries {
                    let tag = match entry.kind {
                        NodeKind::Directory => "d",
                        NodeKind::Device => "c",
                        NodeKind::File => "-",
                    };
                    self.io
                        .write(&format!("{} {:>8}  {}\n", tag, entry.size, entry.name));
                }
                0
            }
            Err(e) => {
                self.io.write(&format!("ls: {}: {}\n", path, e));
                1
            }
        }
    }

    fn cmd_stat(&mut self, args: &[&str]) -> i32 {
        let Some(path) = args.first() else {
            self.io.write("stat: missing path\n");
            return 1;
        };
        let meta = {
            let vfs = fs::get_vfs().read();
            vfs.stat(path)
        };
        match meta {
            Ok(meta) => {
                let kind = match meta.kind {
                    NodeKind::File => "file",
                    NodeKind::Directory => "directory",
                    NodeKind::Device => "device",
                };
                self.io.write(&format!(
                    "{}: {} size {} mode {:o}\n",
                    path, kind, meta.size, meta.mode
                ));
                0
            }
            Err(e) => {
                self.io.write(&format!("stat: {}: {}\n", path, e));
                1
            }
        }
    }

    fn cmd_rm(&mut self, args: &[&str]) -> i32 {
        let Some(path) = args.first() else {
            self.io.write("rm: missing path\n");
            return 1;
        };
        let result = {
            let vfs = fs::get_vfs().read();
            vfs.unlink(path)
        };
        match result {
            Ok(()) => 0,
            Err(e) => {
                self.io.write(&format!("rm: {}: {}\n", path, e));
                1
            }
        }
    }

    fn cmd_mkdir(&mut self, args: &[&str]) -> i32 {
        let Some(path) = args.first() else {
            self.io.write("mkdir: missing path\n");
            return 1;
        };
        let result = {
            let vfs = fs::get_vfs().read();
            vfs.mkdir(path)
        };
        match result {
            Ok(()) => 0,
            Err(e) => {
                self.io.write(&format!("mkdir: {}: {}\n", path, e));
                1
            }
        }
    }

    fn cmd_touch(&mut self, args: &[&str]) -> i32 {
        let Some(path) = args.first() else {
            self.io.write("touch: missing path\n");
            return 1;
        };
        let result = {
            let vfs = fs::get_vfs().read();
            vfs.open(path, fs::OpenFlags::read_write()).map(|_| ())
        };
        match result {
            Ok(()) => 0,
            Err(e) => {
                self.io.write(&format!("touch: {}: {}\n", path, e));
                1
            }
        }
    }

    fn cmd_cd(&mut self, args: &[&str]) -> i32 {
        let path = args.first().copied().unwrap_or("/");
        let result = fs::get_vfs().write().set_cwd(path);
        match result {
            Ok(()) => 0,
            Err(e) => {
                self.io.write(&format!("cd: {}: {}\n", path, e));
                1
            }
        }
    }

    fn cmd_pwd(&mut self) -> i32 {
        let cwd = fs::get_vfs().read().cwd().to_string();
        self.io.write(&cwd);
        self.io.write("\n");
        0
    }

    fn cmd_ps(&mut self) -> i32 {
        self.io.write("  PID STATE    STACK  NAME\n");
        for info in process::processes() {
            let state = match info.state {
                ProcessState::Ready => "ready",
                ProcessState::Running => "running",
                ProcessState::Blocked => "blocked",
                ProcessState::Terminated => "zombie",
            };
            self.io.write(&format!(
                "{:>5} {:<8} {:>6}  {}\n",
                info.pid, state, info.stack_size, info.name
            ));
        }
        0
    }

    fn cmd_kill(&mut self, args: &[&str]) -> i32 {
        let Some(pid) = args.first().and_then(|a| a.parse::<Pid>().ok()) else {
            self.io.write("kill: usage: kill PID\n");
            return 1;
        };
        match process::kill(pid) {
            Ok(()) => 0,
            Err(e) => {
                self.io.write(&format!("kill: {}\n", e));
                1
            }
        }
    }

    fn cmd_free(&mut self) -> i32 {
        let free = crate::mm::pmm::free_pages();
        let total = crate::mm::pmm::total_pages();
        self.io.write(&format!(
            "pages: {} free / {} total ({} KiB free)\n",
            free,
            total,
            free * crate::mm::PAGE_SIZE / 1024
        ));
        0
    }

    fn cmd_heap(&mut self) -> i32 {
        let stats = crate::mm::heap::KERNEL_HEAP.stats();
        self.io.write(&format!(
            "heap: {} live allocations, {} bytes (peak {} / {}), {} allocs, {} frees\n",
            stats.active_count,
            stats.total_bytes,
            stats.peak_count,
            stats.peak_bytes,
            stats.alloc_calls,
            stats.free_calls
        ));
        0
    }

    fn cmd_leaks(&mut self, args: &[&str]) -> i32 {
        let threshold: u64 = args.first().and_then(|a| a.parse().ok()).unwrap_or(5000);
        let mut lines = Vec::new();
        let count = crate::mm::heap::KERNEL_HEAP.report_leaks(threshold, |record| {
            lines.push(format!(
                "  {:#010x}  {:>6} bytes  t={}ms  {}\n",
                record.address, record.size, record.timestamp_ms, record.site
            ));
        });
        self.io
            .write(&format!("{} allocation(s) older than {} ms\n", count, threshold));
        for line in lines {
            self.io.write(&line);
        }
        0
    }

    fn cmd_uptime(&mut self) -> i32 {
        let ms = crate::timer::uptime_ms();
        self.io.write(&format!(
            "up {}.{:03}s ({} ticks)\n",
            ms / 1000,
            ms % 1000,
            crate::timer::ticks()
        ));
        0
    }

    fn cmd_irqs(&mut self) -> i32 {
        for line in 0..16u8 {
            let count = crate::irq::dispatch_count(line);
            if count > 0 {
                self.io.write(&format!("irq {:>2}: {}\n", line, count));
            }
        }
        self.io.write(&format!(
            "unhandled: {}\n",
            crate::irq::unhandled_count()
        ));
        0
    }

    fn cmd_jobs(&mut self) -> i32 {
        if self.jobs.is_empty() {
            self.io.write("no background jobs\n");
        }
        let lines: Vec<String> = self
            .jobs
            .iter()
            .map(|job| format!("pid {:>3}  {}\n", job.pid, job.name))
            .collect();
        for line in lines {
            self.io.write(&line);
        }
        0
    }

    fn cmd_sync(&mut self) -> i32 {
        let result = fs::get_vfs().read().sync();
        match result {
            Ok(()) => 0,
            Err(e) => {
                self.io.write(&format!("sync: {}\n", e));
                1
            }
        }
    }

    fn cmd_clear(&mut self) -> i32 {
        // The terminal interprets form feed as a full clear.
        self.io.write("\u{c}");
        0
    }

    // -- toolchain --------------------------------------------------------

    fn bindings() -> Vec<crate::cupid::KernelBinding> {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            crate::cupid::kernel_bindings()
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        {
            Vec::new()
        }
    }

    fn cmd_cc(&mut self, args: &[&str], background: bool) -> i32 {
        let Some(src_path) = args.first() else {
            self.io.write("cc: usage: cc SRC [-o OUT]\n");
            return 1;
        };
        let out_path = args
            .iter()
            .position(|&a| a == "-o")
            .and_then(|pos| args.get(pos + 1))
            .copied();

        let source = {
            let vfs = fs::get_vfs().read();
            match fs::read_all(&vfs, src_path) {
                Ok(data) => data,
                Err(e) => {
                    self.io.write(&format!("cc: {}: {}\n", src_path, e));
                    return 1;
                }
            }
        };
        let Ok(source) = core::str::from_utf8(&source) else {
            self.io.write(&format!("cc: {}: not a text file\n", src_path));
            return 1;
        };

        let options = crate::cupid::compiler::CompilerOptions {
            bindings: Self::bindings(),
            ..Default::default()
        };
        let program = match crate::cupid::compiler::compile_program(source, options) {
            Ok(program) => program,
            Err(e) => {
                self.io.write(&format!("cc: {}: {}\n", src_path, e));
                return 1;
            }
        };

        match out_path {
            Some(out) => {
                let elf = program.to_elf();
                let result = {
                    let vfs = fs::get_vfs().read();
                    fs::write_all(&vfs, out, &elf)
                };
                match result {
                    Ok(n) => {
                        self.io.write(&format!("cc: wrote {} ({} bytes)\n", out, n));
                        0
                    }
                    Err(e) => {
                        self.io.write(&format!("cc: {}: {}\n", out, e));
                        1
                    }
                }
            }
            None => self.run_jit(&program, src_path, background),
        }
    }

    fn cmd_asm(&mut self, args: &[&str]) -> i32 {
        let Some(src_path) = args.first() else {
            self.io.write("asm: usage: asm SRC [-o OUT]\n");
            return 1;
        };
        let out_path = args
            .iter()
            .position(|&a| a == "-o")
            .and_then(|pos| args.get(pos + 1))
            .copied();

        let source = {
            let vfs = fs::get_vfs().read();
            match fs::read_all(&vfs, src_path) {
                Ok(data) => data,
                Err(e) => {
                    self.io.write(&format!("asm: {}: {}\n", src_path, e));
                    return 1;
                }
            }
        };
        let Ok(source) = core::str::from_utf8(&source) else {
            self.io.write(&format!("asm: {}: not a text file\n", src_path));
            return 1;
        };

        let program = match crate::cupid::assembler::assemble_program(source) {
            Ok(program) => program,
            Err(e) => {
                self.io.write(&format!("asm: {}: {}\n", src_path, e));
                return 1;
            }
        };

        match out_path {
            Some(out) => {
                let elf = program.to_elf();
                let result = {
                    let vfs = fs::get_vfs().read();
                    fs::write_all(&vfs, out, &elf)
                };
                match result {
                    Ok(n) => {
                        self.io.write(&format!("asm: wrote {} ({} bytes)\n", out, n));
                        0
                    }
                    Err(e) => {
                        self.io.write(&format!("asm: {}: {}\n", out, e));
                        1
                    }
                }
            }
            None => self.run_jit(&program, src_path, false),
        }
    }

    #[allow(unused_variables)]
    fn run_jit(&mut self, program: &crate::cupid::Program, name: &str, background: bool) -> i32 {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            match crate::cupid::jit_run(program) {
                Ok(code) => {
                    if code != 0 {
                        self.io.write(&format!("{}: exit {}\n", name, code));
                    }
                    code
                }
                Err(e) => {
                    self.io.write(&format!("{}: {}\n", name, e));
                    1
                }
            }
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        {
            self.io
                .write(&format!("{}: JIT execution needs hardware; use -o\n", name));
            1
        }
    }

    fn cmd_exec(&mut self, args: &[&str], background: bool) -> i32 {
        let Some(path) = args.first() else {
            self.io.write("exec: usage: exec BIN [ARGS]\n");
            return 1;
        };
        self.launch(path, &args[1..], background)
    }

    /// Unknown command word: resolve it as a binary through the VFS.
    fn cmd_external(&mut self, name: &str, args: &[&str], background: bool) -> i32 {
        let exists = {
            let vfs = fs::get_vfs().read();
            vfs.resolve(name).is_ok()
        };
        if exists {
            self.launch(name, args, background)
        } else {
            self.io.write(&format!("{}: unknown command\n", name));
            127
        }
    }

    fn launch(&mut self, path: &str, args: &[&str], background: bool) -> i32 {
        let mut argv: Vec<String> = Vec::new();
        argv.push(path.to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        crate::syscall::set_program_args(argv);

        let pid = match process::loader::exec(path, process::DEFAULT_STACK_SIZE) {
            Ok(pid) => pid,
            Err(e) => {
                self.io.write(&format!(
                    "exec: {}: {}\n",
                    path,
                    process::loader::exec_error_message(&e)
                ));
                return 1;
            }
        };

        if background {
            self.io.write(&format!("[job] {} started as pid {}\n", path, pid));
            self.jobs.push(Job {
                pid,
                name: path.to_string(),
            });
            return 0;
        }

        // Foreground: wait for the child, yielding in between.
        while process::is_alive(pid) {
            crate::sched::yield_now();
            crate::sched::check_reschedule();
        }
        process::take_exit_code(pid).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Console-backed one-shot execution (syscall surface)
// ---------------------------------------------------------------------------

struct PrintIo;

impl ShellIo for PrintIo {
    fn write(&mut self, text: &str) {
        crate::print!("{}", text);
    }

    fn read_key(&mut self) -> KeyEvent {
        // One-shot dispatch never reads input; report an endless stream of
        // newlines if someone tries.
        KeyEvent {
            scancode: 0x1C,
            character: Some('\n'),
            special: None,
            pressed: true,
            timestamp_ms: 0,
        }
    }
}

/// Execute a single command line against the kernel console. Exposed to
/// programs through the syscall table.
pub fn execute_line(line: &str) -> i32 {
    Shell::new(PrintIo).dispatch(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::VecDeque;

    struct ScriptedIo {
        input: VecDeque<KeyEvent>,
        output: String,
    }

    impl ScriptedIo {
        fn new() -> Self {
            Self {
                input: VecDeque::new(),
                output: String::new(),
            }
        }

        fn type_line(&mut self, text: &str) {
            for ch in text.chars() {
                self.input.push_back(key(ch));
            }
            self.input.push_back(key('\n'));
        }
    }

    fn key(ch: char) -> KeyEvent {
        KeyEvent {
            scancode: 0,
            character: Some(ch),
            special: None,
            pressed: true,
            timestamp_ms: 0,
        }
    }

    fn special(s: SpecialKey) -> KeyEvent {
        KeyEvent {
            scancode: 0,
            character: None,
            special: Some(s),
            pressed: true,
            timestamp_ms: 0,
        }
    }

    impl ShellIo for ScriptedIo {
        fn write(&mut self, text: &str) {
            self.output.push_str(text);
        }

        fn read_key(&mut self) -> KeyEvent {
            self.input.pop_front().unwrap_or_else(|| key('\n'))
        }
    }

    fn shell() -> Shell<ScriptedIo> {
        crate::fs::init();
        Shell::new(ScriptedIo::new())
    }

    #[test]
    fn echo_prints_its_arguments() {
        let mut sh = shell();
        sh.dispatch("echo hello world");
        assert_eq!(sh.io().output, "hello world\n");
    }

    #[test]
    fn echo_redirects_then_cat_reads_back() {
        let mut sh = shell();
        sh.dispatch("echo hello > /tmp/a");
        sh.dispatch("cat /tmp/a");
        assert!(sh.io().output.ends_with("hello\n"));

        sh.io().output.clear();
        sh.dispatch("stat /tmp/a");
        assert!(sh.io().output.contains("size 6"));
    }

    #[test]
    fn mkdir_ls_rm_round_trip() {
        let mut sh = shell();
        sh.dispatch("mkdir /tmp/sub");
        sh.dispatch("touch /tmp/sub/file");
        sh.io().output.clear();
        sh.dispatch("ls /tmp/sub");
        assert!(sh.io().output.contains("file"));

        assert_ne!(sh.dispatch("rm /tmp/sub"), 0); // not empty
        sh.dispatch("rm /tmp/sub/file");
        assert_eq!(sh.dispatch("rm /tmp/sub"), 0);
    }

    #[test]
    fn cd_and_pwd_track_the_working_directory() {
        let mut sh = shell();
        sh.dispatch("mkdir /tmp/wd");
        sh.dispatch("cd /tmp/wd");
        sh.io().output.clear();
        sh.dispatch("pwd");
        assert_eq!(sh.io().output, "/tmp/wd\n");
        sh.dispatch("cd /");
    }

    #[test]
    fn unknown_command_reports_127() {
        let mut sh = shell();
        let code = sh.dispatch("definitely-not-a-thing");
        assert_eq!(code, 127);
        assert!(sh.io().output.contains("unknown command"));
    }

    #[test]
    fn missing_file_errors_are_printed_not_fatal() {
        let mut sh = shell();
        assert_ne!(sh.dispatch("cat /no/such/file"), 0);
        assert!(sh.io().output.contains("no such file"));
    }

    #[test]
    fn line_editor_inserts_at_cursor() {
        let mut sh = shell();
        // Type "echo", arrow-left twice, insert "X" -> "ecXho"
        for ch in "echo".chars() {
            sh.io().input.push_back(key(ch));
        }
        sh.io().input.push_back(special(SpecialKey::ArrowLeft));
        sh.io().input.push_back(special(SpecialKey::ArrowLeft));
        sh.io().input.push_back(key('X'));
        sh.io().input.push_back(key('\n'));
        let line = sh.read_line();
        assert_eq!(line, "ecXho");
    }

    #[test]
    fn line_editor_backspace_deletes_before_cursor() {
        let mut sh = shell();
        for ch in "abcd".chars() {
            sh.io().input.push_back(key(ch));
        }
        sh.io().input.push_back(key('\u{8}'));
        sh.io().input.push_back(key('\n'));
        assert_eq!(sh.read_line(), "abc");
    }

    #[test]
    fn cc_compiles_to_an_elf_on_disk() {
        let mut sh = shell();
        sh.io().input.clear();
        let src = "int main() { return 0; }";
        {
            let vfs = crate::fs::get_vfs().read();
            crate::fs::write_all(&vfs, "/tmp/ret0.cc", src.as_bytes()).unwrap();
        }
        let code = sh.dispatch("cc /tmp/ret0.cc -o /tmp/ret0");
        assert_eq!(code, 0, "output: {}", sh.io().output);

        let elf = {
            let vfs = crate::fs::get_vfs().read();
            crate::fs::read_all(&vfs, "/tmp/ret0").unwrap()
        };
        let parsed = crate::elf::parse(&elf).unwrap();
        assert!(!parsed.segments.is_empty());
    }

    #[test]
    fn cc_reports_compile_errors_with_line() {
        let mut sh = shell();
        {
            let vfs = crate::fs::get_vfs().read();
            crate::fs::write_all(&vfs, "/tmp/bad.cc", b"int main() {\n  return oops;\n}").unwrap();
        }
        let code = sh.dispatch("cc /tmp/bad.cc -o /tmp/bad");
        assert_ne!(code, 0);
        assert!(sh.io().output.contains("line 2"));
    }

    #[test]
    fn asm_assembles_to_an_elf_on_disk() {
        let mut sh = shell();
        {
            let vfs = crate::fs::get_vfs().read();
            crate::fs::write_all(
                &vfs,
                "/tmp/min.s",
                b"main:\n mov eax, 7\n ret\n",
            )
            .unwrap();
        }
        let code = sh.dispatch("asm /tmp/min.s -o /tmp/min");
        assert_eq!(code, 0, "output: {}", sh.io().output);
        let elf = {
            let vfs = crate::fs::get_vfs().read();
            crate::fs::read_all(&vfs, "/tmp/min").unwrap()
        };
        assert!(crate::elf::parse(&elf).is_ok());
    }
}
