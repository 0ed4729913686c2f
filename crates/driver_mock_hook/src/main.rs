use driver_protocol::runtime::run_stdio;
use driver_mock_hook::MockHookDriver;

fn main() -> anyhow::Result<()> {
    run_stdio(&mut MockHookDriver::default())
}
