use fleetmark::entry;
use fleetmark::error::AppResult;

fn main() -> AppResult<()> {
    entry::run()
}
