#![deny(unsafe_code)]
#![doc = "strand-cmdlet: 以 `async` 编写宿主命令的基类适配层。"]
#![doc = ""]
#![doc = "宿主的同步生命周期钩子（begin/process/end）各自对应一次 `run_phase`，"]
#![doc = "阶段中的宿主写入经由 [`CmdletRuntime`] 回到拥有线程，按提交顺序执行。"]
#![doc = ""]
#![doc = "```"]
#![doc = "use strand_cmdlet::{AsyncCmdlet, CmdletAdapter, CmdletRuntime, CommandHost, HostError};"]
#![doc = "use strand_cmdlet::records::{ErrorRecord, InformationRecord, ProgressRecord};"]
#![doc = "use strand_core::AdapterError;"]
#![doc = ""]
#![doc = "#[derive(Default)]"]
#![doc = "struct Collect(Vec<u32>);"]
#![doc = ""]
#![doc = "impl CommandHost for Collect {"]
#![doc = "    type Output = u32;"]
#![doc = "    fn write_object(&mut self, output: u32) -> Result<(), HostError> { self.0.push(output); Ok(()) }"]
#![doc = "    fn write_error(&mut self, _: ErrorRecord) -> Result<(), HostError> { Ok(()) }"]
#![doc = "    fn write_warning(&mut self, _: String) -> Result<(), HostError> { Ok(()) }"]
#![doc = "    fn write_verbose(&mut self, _: String) -> Result<(), HostError> { Ok(()) }"]
#![doc = "    fn write_debug(&mut self, _: String) -> Result<(), HostError> { Ok(()) }"]
#![doc = "    fn write_progress(&mut self, _: ProgressRecord) -> Result<(), HostError> { Ok(()) }"]
#![doc = "    fn write_information(&mut self, _: InformationRecord) -> Result<(), HostError> { Ok(()) }"]
#![doc = "}"]
#![doc = ""]
#![doc = "struct Answer;"]
#![doc = ""]
#![doc = "#[async_trait::async_trait(?Send)]"]
#![doc = "impl AsyncCmdlet for Answer {"]
#![doc = "    type Host = Collect;"]
#![doc = "    async fn process_record(&mut self, runtime: &CmdletRuntime<Collect>) -> Result<(), AdapterError> {"]
#![doc = "        runtime.write_object(42)?.await"]
#![doc = "    }"]
#![doc = "}"]
#![doc = ""]
#![doc = "let mut adapter = CmdletAdapter::new(Answer, Collect::default());"]
#![doc = "adapter.begin_processing().expect(\"begin\");"]
#![doc = "adapter.process_record().expect(\"process\");"]
#![doc = "adapter.end_processing().expect(\"end\");"]
#![doc = "```"]

pub mod cmdlet;
pub mod host;
pub mod records;
pub mod runtime;

pub use cmdlet::{AsyncCmdlet, CmdletAdapter, Phase, StopHandle};
pub use host::{CommandHost, HostError};
pub use runtime::{CmdletRuntime, Dispatch};
